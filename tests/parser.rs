// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use stratus::unstable::*;

fn parse(contents: &str) -> Result<Program> {
    let source = Source::from_contents("case.strat".to_string(), contents.to_string())?;
    Parser::new(&source)?.parse()
}

fn parse_err(contents: &str) -> String {
    match parse(contents) {
        Ok(_) => panic!("expected a parse error for {contents}"),
        Err(e) => e.to_string(),
    }
}

#[test]
fn schema_properties() -> Result<()> {
    let program = parse(
        r#"
        schema vm {
            string name
            input string size
            cloud string id
            output string endpoint = makeEndpoint(name)
            bool enabled = true
        }
        "#,
    )?;
    assert_eq!(program.statements.len(), 1);
    let Statement::Schema { name, properties, .. } = program.statements[0].as_ref() else {
        panic!("expected a schema statement");
    };
    assert_eq!(name.text(), "vm");
    assert_eq!(properties.len(), 5);

    assert_eq!(properties[0].name.text(), "name");
    assert_eq!(properties[0].role, PropertyRole::Regular);
    assert!(!properties[0].cloud);
    assert!(properties[0].default.is_none());

    assert_eq!(properties[1].role, PropertyRole::Input);
    assert!(properties[2].cloud);
    assert_eq!(properties[3].role, PropertyRole::Output);
    assert!(properties[3].default.is_some());
    assert_eq!(properties[4].ty, TypeName::Bool);
    assert!(properties[4].default.is_some());
    Ok(())
}

#[test]
fn cloud_property_rejects_literal_initializer() {
    let msg = parse_err(r#"schema s { cloud string id = "x" }"#);
    assert!(msg.contains("literal"), "unexpected message: {msg}");
}

#[test]
fn output_property_rejects_literal_initializer() {
    let msg = parse_err(r#"schema s { output string ep = "x" }"#);
    assert!(msg.contains("literal"), "unexpected message: {msg}");
}

#[test]
fn duplicate_property_rejected() {
    let msg = parse_err("schema s { string a \n number a }");
    assert!(msg.contains("duplicate"), "unexpected message: {msg}");
}

#[test]
fn component_definition_vs_instantiation() -> Result<()> {
    let program = parse(
        r#"
        component app {
            input string prefix
            output string bucketName
            resource bucket b { name = prefix }
        }
        component app web { prefix = "corp" }
        "#,
    )?;
    let Statement::ComponentDef { name, properties, body, .. } = program.statements[0].as_ref()
    else {
        panic!("expected a component definition");
    };
    assert_eq!(name.text(), "app");
    assert_eq!(properties.len(), 2);
    assert_eq!(body.len(), 1);

    let Statement::Instance { kind, type_name, name, fields, .. } =
        program.statements[1].as_ref()
    else {
        panic!("expected a component instantiation");
    };
    assert_eq!(*kind, InstanceKind::Component);
    assert_eq!(type_name.text(), "app");
    assert_eq!(name.text(), "web");
    assert_eq!(fields.len(), 1);
    Ok(())
}

#[test]
fn resource_instance_fields() -> Result<()> {
    let program = parse(r#"resource bucket logs { name = "logs" versioned = true }"#)?;
    let Statement::Instance { kind, fields, .. } = program.statements[0].as_ref() else {
        panic!("expected an instance statement");
    };
    assert_eq!(*kind, InstanceKind::Resource);
    assert_eq!(fields.len(), 2);
    assert_eq!(fields[0].name.text(), "name");
    Ok(())
}

#[test]
fn field_assigned_twice_rejected() {
    let msg = parse_err(r#"resource bucket b { name = "a" name = "b" }"#);
    assert!(msg.contains("twice"), "unexpected message: {msg}");
}

#[test]
fn multiplication_binds_tighter_than_addition() -> Result<()> {
    let program = parse("var x = 1 + 2 * 3")?;
    let Statement::Var { value, .. } = program.statements[0].as_ref() else {
        panic!("expected a var statement");
    };
    let Expr::ArithExpr { op: ArithOp::Add, rhs, .. } = value.as_ref() else {
        panic!("expected addition at the top");
    };
    assert!(matches!(
        rhs.as_ref(),
        Expr::ArithExpr { op: ArithOp::Mul, .. }
    ));
    Ok(())
}

#[test]
fn comparison_binds_looser_than_arithmetic() -> Result<()> {
    let program = parse("var x = a + 1 < b * 2")?;
    let Statement::Var { value, .. } = program.statements[0].as_ref() else {
        panic!("expected a var statement");
    };
    assert!(matches!(
        value.as_ref(),
        Expr::BoolExpr { op: BoolOp::Lt, .. }
    ));
    Ok(())
}

#[test]
fn logic_operators_bind_loosest() -> Result<()> {
    let program = parse("var x = a == 1 && b == 2 || c")?;
    let Statement::Var { value, .. } = program.statements[0].as_ref() else {
        panic!("expected a var statement");
    };
    let Expr::LogicExpr { op: LogicOp::Or, lhs, .. } = value.as_ref() else {
        panic!("expected `||` at the top");
    };
    assert!(matches!(
        lhs.as_ref(),
        Expr::LogicExpr { op: LogicOp::And, .. }
    ));
    Ok(())
}

#[test]
fn comprehension_with_index_guard_and_else() -> Result<()> {
    let program = parse("var ys = [for x, i in xs: x if i > 0 else 0]")?;
    let Statement::Var { value, .. } = program.statements[0].as_ref() else {
        panic!("expected a var statement");
    };
    let Expr::ArrayCompr { compr, .. } = value.as_ref() else {
        panic!("expected a comprehension");
    };
    assert_eq!(compr.item.text(), "x");
    assert_eq!(compr.index.as_ref().map(|s| s.text()), Some("i"));
    let guard = compr.guard.as_ref().expect("guard");
    assert!(guard.otherwise.is_some());
    Ok(())
}

#[test]
fn array_literal_is_not_a_comprehension() -> Result<()> {
    let program = parse("var xs = [1, 2, 3]")?;
    let Statement::Var { value, .. } = program.statements[0].as_ref() else {
        panic!("expected a var statement");
    };
    assert!(matches!(value.as_ref(), Expr::Array { items, .. } if items.len() == 3));
    Ok(())
}

#[test]
fn for_loop_with_index() -> Result<()> {
    let program = parse("for x, i in xs { var y = x }")?;
    let Statement::For { item, index, body, .. } = program.statements[0].as_ref() else {
        panic!("expected a for statement");
    };
    assert_eq!(item.text(), "x");
    assert_eq!(index.as_ref().map(|s| s.text()), Some("i"));
    assert_eq!(body.len(), 1);
    Ok(())
}

#[test]
fn else_if_chains() -> Result<()> {
    let program = parse("if a { } else if b { } else { var x = 1 }")?;
    let Statement::If { else_body, .. } = program.statements[0].as_ref() else {
        panic!("expected an if statement");
    };
    assert_eq!(else_body.len(), 1);
    let Statement::If { else_body: inner, .. } = else_body[0].as_ref() else {
        panic!("expected a nested if");
    };
    assert_eq!(inner.len(), 1);
    Ok(())
}

#[test]
fn sensitive_output() -> Result<()> {
    let program = parse("sensitive output string secret = x")?;
    let Statement::Output { sensitive, ty, name, .. } = program.statements[0].as_ref() else {
        panic!("expected an output statement");
    };
    assert!(sensitive);
    assert_eq!(*ty, TypeName::String);
    assert_eq!(name.text(), "secret");
    Ok(())
}

#[test]
fn import_with_alias() -> Result<()> {
    let program = parse(r#"import "lib.strat" as lib"#)?;
    let Statement::Import { alias, .. } = program.statements[0].as_ref() else {
        panic!("expected an import statement");
    };
    assert_eq!(alias.as_ref().map(|s| s.text()), Some("lib"));
    Ok(())
}

#[test]
fn invalid_assignment_target() {
    let msg = parse_err("length(x) = 2");
    assert!(msg.contains("assignment target"), "unexpected message: {msg}");
}

#[test]
fn keyword_cannot_start_an_expression() {
    assert!(parse("else").is_err());
}

#[test]
fn assignment_through_reference_chain() -> Result<()> {
    let program = parse(r#"cfg.servers[0].name = "a""#)?;
    let Statement::Assign { target, .. } = program.statements[0].as_ref() else {
        panic!("expected an assignment");
    };
    assert!(matches!(target.as_ref(), Expr::RefDot { .. }));
    Ok(())
}
