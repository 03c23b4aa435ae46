// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use stratus::{Engine, EvalError, EvalResults, Value};

fn eval(contents: &str) -> Result<EvalResults> {
    let mut engine = Engine::new();
    engine.add_source("main.strat", contents)?;
    engine.eval()
}

fn output<'a>(results: &'a EvalResults, name: &str) -> &'a Value {
    &results
        .outputs
        .iter()
        .find(|o| o.name == name)
        .unwrap_or_else(|| panic!("no output `{name}`"))
        .value
}

fn eval_kind(contents: &str) -> EvalError {
    let err = eval(contents).expect_err("expected an evaluation error");
    err.downcast_ref::<EvalError>()
        .unwrap_or_else(|| panic!("not an EvalError: {err:#}"))
        .clone()
}

#[test]
fn forward_references_resolve() -> Result<()> {
    let results = eval(
        r#"
        output string n = web.name
        schema vm { string name }
        resource vm web { name = "web-1" }
        "#,
    )?;
    assert_eq!(output(&results, "n"), &Value::from("web-1"));
    Ok(())
}

#[test]
fn declaration_order_is_irrelevant_across_files() -> Result<()> {
    let mut engine = Engine::new();
    engine.add_source("outputs.strat", "output string n = web.name")?;
    engine.add_source(
        "infra.strat",
        r#"
        schema vm { string name }
        resource vm web { name = "web-1" }
        "#,
    )?;
    let results = engine.eval()?;
    assert_eq!(output(&results, "n"), &Value::from("web-1"));
    Ok(())
}

#[test]
fn chain_order_permutations_agree() -> Result<()> {
    // a -> b -> c in every declaration order.
    let resources = [
        "resource vm a { n = b.n + 1 }",
        "resource vm b { n = c.n + 1 }",
        "resource vm c { n = 1 }",
    ];
    let orders: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    for order in orders {
        let mut src = String::from("schema vm { number n }\n");
        for idx in order {
            src.push_str(resources[idx]);
            src.push('\n');
        }
        src.push_str("output number top = a.n\n");
        let results = eval(&src)?;
        assert_eq!(output(&results, "top"), &Value::from(3i64), "{order:?}");
    }
    Ok(())
}

#[test]
fn self_reference_is_a_cycle() {
    let kind = eval_kind(
        r#"
        schema s { any v }
        resource s a { v = a.v }
        "#,
    );
    match kind {
        EvalError::Cycle { chain } => assert_eq!(chain, ["s.a", "s.a"]),
        other => panic!("expected Cycle, got {other}"),
    }
}

#[test]
fn indirect_cycle_reports_the_full_chain() {
    let kind = eval_kind(
        r#"
        schema s { any v }
        resource s a { v = b.v }
        resource s b { v = a.v }
        "#,
    );
    match kind {
        EvalError::Cycle { chain } => assert_eq!(chain, ["s.a", "s.b", "s.a"]),
        other => panic!("expected Cycle, got {other}"),
    }
}

#[test]
fn three_node_cycle_reports_the_full_chain() {
    let kind = eval_kind(
        r#"
        schema s { any v }
        resource s a { v = b.v }
        resource s b { v = c.v }
        resource s c { v = a.v }
        "#,
    );
    match kind {
        EvalError::Cycle { chain } => assert_eq!(chain, ["s.a", "s.b", "s.c", "s.a"]),
        other => panic!("expected Cycle, got {other}"),
    }
}

#[test]
fn duplicate_schema_rejected() {
    let kind = eval_kind("schema s { } \n schema s { }");
    assert!(matches!(kind, EvalError::Duplicate(name) if name == "s"));
}

#[test]
fn duplicate_instance_rejected() {
    let kind = eval_kind(
        r#"
        schema s { }
        resource s a { }
        resource s a { }
        "#,
    );
    assert!(matches!(kind, EvalError::Duplicate(path) if path == "s.a"));
}

#[test]
fn loop_iterations_get_index_keys() -> Result<()> {
    let src = r#"
        schema node { number val }
        var xs = [10, 20, 30]
        for x, i in xs {
            resource node n { val = x }
        }
        output number second = n[1].val
    "#;
    let mut engine = Engine::new();
    engine.add_source("main.strat", src)?;
    let results = engine.eval()?;
    assert_eq!(output(&results, "second"), &Value::from(20i64));
    assert_eq!(engine.instance_count(), 3);

    let item = engine.lookup_instance("node.n[2]")?;
    assert_eq!(item["val"], Value::from(30i64));
    Ok(())
}

#[test]
fn object_loops_get_key_subscripts() -> Result<()> {
    let src = r#"
        schema vpc { string region }
        var regions = {"east": "use1", "west": "usw2"}
        for r, k in regions {
            resource vpc net { region = r }
        }
        output string east = net["east"].region
    "#;
    let mut engine = Engine::new();
    engine.add_source("main.strat", src)?;
    let results = engine.eval()?;
    assert_eq!(output(&results, "east"), &Value::from("use1"));

    let west = engine.lookup_instance(r#"vpc.net["west"]"#)?;
    assert_eq!(west["region"], Value::from("usw2"));
    Ok(())
}

#[test]
fn strings_iterate_by_character() -> Result<()> {
    let results = eval(
        r#"
        var parts = []
        for ch, i in "abc" {
            parts = concat(parts, [string(i) + ch])
        }
        output array walked = parts
        output array letters = [for c in "ab": c + "!"]
        "#,
    )?;
    assert_eq!(
        output(&results, "walked"),
        &Value::from_json_str(r#"["0a", "1b", "2c"]"#)?
    );
    assert_eq!(
        output(&results, "letters"),
        &Value::from_json_str(r#"["a!", "b!"]"#)?
    );
    Ok(())
}

#[test]
fn repeated_loop_key_is_a_duplicate() {
    let kind = eval_kind(
        r#"
        schema s { }
        var xs = [1]
        for x, i in xs { resource s a { } }
        for y, j in xs { resource s a { } }
        "#,
    );
    assert!(matches!(kind, EvalError::Duplicate(path) if path == "s.a[0]"));
}

#[test]
fn loops_key_instances_by_element_value() -> Result<()> {
    let src = r#"
        schema vm { string name }
        for i in ["prod", "test"] {
            resource vm main { name = i }
        }
        output string prod = main["prod"].name
    "#;
    let mut engine = Engine::new();
    engine.add_source("main.strat", src)?;
    let results = engine.eval()?;
    assert_eq!(output(&results, "prod"), &Value::from("prod"));
    assert_eq!(engine.instance_count(), 2);

    let test = engine.lookup_instance(r#"vm.main["test"]"#)?;
    assert_eq!(test["name"], Value::from("test"));
    Ok(())
}

#[test]
fn duplicate_loop_element_key_rejected() {
    let kind = eval_kind(
        r#"
        schema vm { string name }
        for i in ["dup", "dup"] {
            resource vm main { name = i }
        }
        "#,
    );
    assert!(matches!(kind, EvalError::Duplicate(path) if path == r#"vm.main["dup"]"#));
}

#[test]
fn instance_fields_cannot_be_mutated() {
    let kind = eval_kind(
        r#"
        schema s { number x }
        resource s a { x = 1 }
        a.x = 5
        "#,
    );
    match kind {
        EvalError::Mutation { path, field } => {
            assert_eq!(path, "s.a");
            assert_eq!(field, "x");
        }
        other => panic!("expected Mutation, got {other}"),
    }
}

#[test]
fn typed_address_mutation_rejected() {
    let kind = eval_kind(
        r#"
        schema s { number x }
        resource s a { x = 1 }
        s.a.x = 5
        "#,
    );
    match kind {
        EvalError::Mutation { path, field } => {
            assert_eq!(path, "s.a");
            assert_eq!(field, "x");
        }
        other => panic!("expected Mutation, got {other}"),
    }
}

#[test]
fn local_variables_may_be_reassigned() -> Result<()> {
    let results = eval(
        r#"
        var cfg = {"replicas": 1}
        cfg.replicas = 3
        cfg.extra.depth = "deep"
        output number r = cfg.replicas
        output string d = cfg.extra.depth
        "#,
    )?;
    assert_eq!(output(&results, "r"), &Value::from(3i64));
    assert_eq!(output(&results, "d"), &Value::from("deep"));
    Ok(())
}

#[test]
fn unbound_input_is_missing() {
    let kind = eval_kind(
        r#"
        schema db { input string pwd }
        resource db main { }
        "#,
    );
    assert!(matches!(kind, EvalError::MissingInput(which) if which == "db.pwd"));
}

#[test]
fn inputs_resolve_from_schema_section_then_flat() -> Result<()> {
    let src = r#"
        schema db { input string pwd }
        resource db main { }
        output string p = main.pwd
    "#;

    let mut engine = Engine::new();
    engine.add_source("main.strat", src)?;
    engine.set_inputs(Value::from_json_str(r#"{"db": {"pwd": "hunter2"}}"#)?)?;
    let results = engine.eval()?;
    assert_eq!(output(&results, "p"), &Value::from("hunter2"));

    let mut engine = Engine::new();
    engine.add_source("main.strat", src)?;
    engine.set_inputs(Value::from_json_str(r#"{"pwd": "flat"}"#)?)?;
    let results = engine.eval()?;
    assert_eq!(output(&results, "p"), &Value::from("flat"));
    Ok(())
}

#[test]
fn input_resolver_is_a_fallback() -> Result<()> {
    let mut engine = Engine::new();
    engine.add_source(
        "main.strat",
        r#"
        schema db { input string pwd }
        resource db main { }
        output string p = main.pwd
        "#,
    )?;
    engine.set_input_resolver(Box::new(|ty, prop| {
        Ok(Some(Value::from(format!("{ty}:{prop}"))))
    }));
    let results = engine.eval()?;
    assert_eq!(output(&results, "p"), &Value::from("db:pwd"));
    Ok(())
}

#[test]
fn input_defaults_win_over_the_resolver() -> Result<()> {
    let results = eval(
        r#"
        schema web { input string tier = "basic" }
        resource web w { }
        output string t = w.tier
        "#,
    )?;
    assert_eq!(output(&results, "t"), &Value::from("basic"));
    Ok(())
}

#[test]
fn typed_references_force_later_declarations() -> Result<()> {
    let results = eval(
        r#"
        schema vm {
            string name
            number maxCount = 0
        }
        resource vm second { name = "second" maxCount = vm.main.maxCount }
        resource vm main { name = "main" maxCount = 2 }
        output number first = vm.main.maxCount
        output number forwarded = second.maxCount
        "#,
    )?;
    assert_eq!(output(&results, "first"), &Value::from(2i64));
    assert_eq!(output(&results, "forwarded"), &Value::from(2i64));
    Ok(())
}

#[test]
fn explicit_fields_override_defaults() -> Result<()> {
    let results = eval(
        r#"
        schema vm { number x = 2 }
        resource vm main { x = 3 }
        resource vm spare { }
        output number explicit = main.x
        output number defaulted = spare.x
        "#,
    )?;
    assert_eq!(output(&results, "explicit"), &Value::from(3i64));
    assert_eq!(output(&results, "defaulted"), &Value::from(2i64));
    Ok(())
}

#[test]
fn loop_bindings_do_not_leak() {
    let kind = eval_kind(
        r#"
        var xs = [1]
        for x in xs { var inner = x }
        output number y = inner
        "#,
    );
    assert!(matches!(kind, EvalError::NotFound(name) if name == "inner"));

    let kind = eval_kind(
        r#"
        var xs = [1]
        for x in xs { }
        output number y = x
        "#,
    );
    assert!(matches!(kind, EvalError::NotFound(name) if name == "x"));
}

#[test]
fn defaults_may_reference_earlier_fields() -> Result<()> {
    let results = eval(
        r#"
        schema disk {
            string name
            string mount = "/mnt/" + name
        }
        resource disk d { name = "data" }
        output string m = d.mount
        "#,
    )?;
    assert_eq!(output(&results, "m"), &Value::from("/mnt/data"));
    Ok(())
}

#[test]
fn component_instances_nest_their_resources() -> Result<()> {
    let src = r#"
        schema bucket { string name }
        component app {
            input string prefix
            output string bucketName
            resource bucket b { name = prefix + "-data" }
            var bucketName = b.name
        }
        component app web { prefix = "corp" }
        output string n = web.bucketName
    "#;
    let mut engine = Engine::new();
    engine.add_source("main.strat", src)?;
    let results = engine.eval()?;
    assert_eq!(output(&results, "n"), &Value::from("corp-data"));

    let nested = engine.lookup_instance("app.web.bucket.b")?;
    assert_eq!(nested["name"], Value::from("corp-data"));

    let deps = engine.instance_dependencies("app.web")?;
    assert!(deps.contains(&"app.web.bucket.b".to_string()), "{deps:?}");
    Ok(())
}

#[test]
fn nested_component_resources_are_private() {
    let setup = r#"
        schema bucket { string name }
        component app {
            resource bucket b { name = "inner" }
        }
        component app web { }
    "#;

    let kind = eval_kind(&format!("{setup}\noutput string n = b.name"));
    assert!(matches!(kind, EvalError::NotFound(name) if name == "b"));

    let kind = eval_kind(&format!("{setup}\noutput string n = bucket.b.name"));
    assert!(matches!(kind, EvalError::NotFound(name) if name == "bucket"));
}

#[test]
fn component_without_output_binding_is_missing_output() {
    let kind = eval_kind(
        r#"
        schema bucket { string name }
        component app {
            input string prefix
            output string bucketName
            resource bucket b { name = prefix }
        }
        component app web { prefix = "x" }
        "#,
    );
    assert!(matches!(kind, EvalError::MissingOutput(which) if which == "app.bucketName"));
}

#[test]
fn component_inputs_are_evaluated_in_caller_scope() -> Result<()> {
    let results = eval(
        r#"
        var env = "prod"
        component app {
            input string name
            output string tag
            var tag = upper(name)
        }
        component app a { name = env + "-app" }
        output string t = a.tag
        "#,
    )?;
    assert_eq!(output(&results, "t"), &Value::from("PROD-APP"));
    Ok(())
}

#[test]
fn functions_capture_their_defining_scope() -> Result<()> {
    let results = eval(
        r#"
        var base = 10
        fun add(n) { return base + n }
        output number r = add(5)
        "#,
    )?;
    assert_eq!(output(&results, "r"), &Value::from(15i64));
    Ok(())
}

#[test]
fn closures_ignore_call_site_shadows() -> Result<()> {
    let results = eval(
        r#"
        fun make() {
            var base = 10
            fun add(n) { return base + n }
            return add
        }
        var add5 = make()
        var base = 100
        output number r = add5(5)
        "#,
    )?;
    assert_eq!(output(&results, "r"), &Value::from(15i64));
    Ok(())
}

#[test]
fn recursion_through_conditionals() -> Result<()> {
    let results = eval(
        r#"
        fun fact(k) {
            if k <= 1 { return 1 }
            return k * fact(k - 1)
        }
        output number f = fact(5)
        "#,
    )?;
    assert_eq!(output(&results, "f"), &Value::from(120i64));
    Ok(())
}

#[test]
fn integer_overflow_is_an_error_not_a_panic() {
    let err = eval("output number n = -9223372036854775808 % -1")
        .expect_err("expected an arithmetic error");
    assert!(err.to_string().contains("overflow"), "{err:#}");

    let err = eval("output number n = -9223372036854775808 / -1")
        .expect_err("expected an arithmetic error");
    assert!(err.to_string().contains("overflow"), "{err:#}");
}

#[test]
fn comprehensions_map_filter_and_select() -> Result<()> {
    let results = eval(
        r#"
        var xs = [1, 2, 3, 4]
        output array doubled = [for x in xs: x * 2]
        output array evens = [for x in xs: x if x % 2 == 0]
        output array clamped = [for x in xs: x if x < 3 else 3]
        output array labels = [for x, i in xs: string(i) + ":" + string(x)]
        "#,
    )?;
    assert_eq!(
        output(&results, "doubled"),
        &Value::from_json_str("[2, 4, 6, 8]")?
    );
    assert_eq!(output(&results, "evens"), &Value::from_json_str("[2, 4]")?);
    assert_eq!(
        output(&results, "clamped"),
        &Value::from_json_str("[1, 2, 3, 3]")?
    );
    assert_eq!(
        output(&results, "labels"),
        &Value::from_json_str(r#"["0:1", "1:2", "2:3", "3:4"]"#)?
    );
    Ok(())
}

#[test]
fn builtin_functions() -> Result<()> {
    let results = eval(
        r#"
        output number len = length("abc")
        output array r = range(0, 3)
        output string joined = join(["a", "b"], "-")
        output array parts = split("a-b", "-")
        output string up = upper("abc")
        output bool has = contains("hello", "ell")
        output string ty = type(3)
        output array ks = keys({"b": 1, "a": 2})
        "#,
    )?;
    assert_eq!(output(&results, "len"), &Value::from(3i64));
    assert_eq!(output(&results, "r"), &Value::from_json_str("[0, 1, 2]")?);
    assert_eq!(output(&results, "joined"), &Value::from("a-b"));
    assert_eq!(
        output(&results, "parts"),
        &Value::from_json_str(r#"["a", "b"]"#)?
    );
    assert_eq!(output(&results, "up"), &Value::from("ABC"));
    assert_eq!(output(&results, "has"), &Value::from(true));
    assert_eq!(output(&results, "ty"), &Value::from("number"));
    assert_eq!(
        output(&results, "ks"),
        &Value::from_json_str(r#"["a", "b"]"#)?
    );
    Ok(())
}

#[test]
fn cloud_properties_are_undefined_and_propagate() -> Result<()> {
    let results = eval(
        r#"
        schema vm {
            string name
            cloud string id
        }
        resource vm a { name = "a" }
        output string cid = a.id
        output string combo = a.id + "-suffix"
        output bool cmp = a.id == "x"
        output string idx = a.id["k"]
        "#,
    )?;
    assert!(output(&results, "cid").is_undefined());
    assert!(output(&results, "combo").is_undefined());
    assert!(output(&results, "cmp").is_undefined());
    assert!(output(&results, "idx").is_undefined());
    Ok(())
}

#[test]
fn conditionals_declare_instances_on_demand() -> Result<()> {
    let src = r#"
        var flag = true
        output string n = a.name
        schema s { string name }
        if flag {
            resource s a { name = "yes" }
        } else {
            resource s b { name = "no" }
        }
    "#;
    let mut engine = Engine::new();
    engine.add_source("main.strat", src)?;
    let results = engine.eval()?;
    assert_eq!(output(&results, "n"), &Value::from("yes"));

    // The branch not taken declares nothing.
    let err = engine.lookup_instance("s.b").expect_err("s.b");
    assert!(matches!(
        err.downcast_ref::<EvalError>(),
        Some(EvalError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn unknown_references_are_not_found() {
    let kind = eval_kind("output string n = nothing.name");
    assert!(matches!(kind, EvalError::NotFound(name) if name == "nothing"));
}

#[test]
fn unknown_schema_property_rejected() {
    let kind = eval_kind(
        r#"
        schema s { string name }
        resource s a { size = 4 }
        "#,
    );
    assert!(matches!(kind, EvalError::NotFound(which) if which == "s.size"));
}

#[test]
fn cloud_properties_cannot_be_assigned() {
    let err = eval(
        r#"
        schema vm { cloud string id }
        resource vm a { id = "x" }
        "#,
    )
    .expect_err("cloud assignment");
    assert!(err.to_string().contains("cannot be assigned"), "{err:#}");
}

#[test]
fn output_types_are_checked() {
    let err = eval("output number n = \"text\"").expect_err("type mismatch");
    assert!(err.to_string().contains("expected a value of type"), "{err:#}");
}

#[test]
fn top_level_return_is_an_error() {
    let err = eval("return 1").expect_err("top-level return");
    assert!(err.to_string().contains("outside of a function"), "{err:#}");
}

#[test]
fn if_condition_must_be_boolean() {
    let err = eval("if 1 { }").expect_err("non-bool condition");
    assert!(err.to_string().contains("must be a boolean"), "{err:#}");
}

#[test]
fn duplicate_variable_in_scope_rejected() {
    let kind = eval_kind("var x = 1 \n var x = 2");
    assert!(matches!(kind, EvalError::Duplicate(name) if name == "x"));
}

#[test]
fn resource_keyword_must_match_schema_kind() {
    let err = eval(
        r#"
        component app { input string x }
        resource app a { }
        "#,
    )
    .expect_err("kind mismatch");
    assert!(err.to_string().contains("use `component`"), "{err:#}");
}
