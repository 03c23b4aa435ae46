// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use stratus::{Engine, EvalError, Value};

use std::cell::Cell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("stratus-tests-{}-{name}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn eval_is_idempotent() -> Result<()> {
    let mut engine = Engine::new();
    engine.add_source("main.strat", r#"output string n = "a""#)?;
    let first = engine.eval()?;
    let second = engine.eval()?;
    assert_eq!(first.outputs.len(), 1);
    assert_eq!(second.outputs.len(), 1);
    assert_eq!(first.outputs[0].value, second.outputs[0].value);
    Ok(())
}

#[test]
fn sources_cannot_be_added_after_eval() -> Result<()> {
    let mut engine = Engine::new();
    engine.add_source("main.strat", r#"output string n = "a""#)?;
    engine.eval()?;
    let err = engine
        .add_source("late.strat", "var x = 1")
        .expect_err("late source");
    assert!(err.to_string().contains("after evaluation"), "{err:#}");
    Ok(())
}

#[test]
fn inputs_must_be_an_object() {
    let mut engine = Engine::new();
    let err = engine.set_inputs(Value::from(1i64)).expect_err("inputs");
    assert!(err.to_string().contains("must be an object"), "{err:#}");
}

#[test]
fn extensions_run_once_per_evaluation() -> Result<()> {
    let count = Rc::new(Cell::new(0usize));
    let c = count.clone();

    let mut engine = Engine::new();
    engine.add_source("main.strat", r#"output string t = tag("x")"#)?;
    engine.add_extension(
        "tag".to_string(),
        1,
        Box::new(move |mut args| {
            c.set(c.get() + 1);
            let s = args.remove(0);
            Ok(Value::from(format!("tag-{}", s.as_string()?)))
        }),
    )?;

    let first = engine.eval()?;
    let second = engine.eval()?;
    assert_eq!(first.outputs[0].value, Value::from("tag-x"));
    assert_eq!(second.outputs[0].value, Value::from("tag-x"));
    assert_eq!(count.get(), 1);
    Ok(())
}

#[test]
fn extension_arity_is_checked() -> Result<()> {
    let mut engine = Engine::new();
    engine.add_source("main.strat", r#"output string t = tag("a", "b")"#)?;
    engine.add_extension("tag".to_string(), 1, Box::new(|_| Ok(Value::Null)))?;
    let err = engine.eval().expect_err("arity");
    assert!(err.to_string().contains("expects 1 argument"), "{err:#}");
    Ok(())
}

#[test]
fn extensions_cannot_shadow_builtins() {
    let mut engine = Engine::new();
    let err = engine
        .add_extension("length".to_string(), 1, Box::new(|_| Ok(Value::Null)))
        .expect_err("builtin shadow");
    assert!(err.to_string().contains("builtin"), "{err:#}");
}

#[test]
fn extensions_register_once() -> Result<()> {
    let mut engine = Engine::new();
    engine.add_extension("tag".to_string(), 1, Box::new(|_| Ok(Value::Null)))?;
    let err = engine
        .add_extension("tag".to_string(), 1, Box::new(|_| Ok(Value::Null)))
        .expect_err("duplicate extension");
    assert!(err.to_string().contains("already registered"), "{err:#}");
    Ok(())
}

#[test]
fn undefined_arguments_skip_the_extension() -> Result<()> {
    let count = Rc::new(Cell::new(0usize));
    let c = count.clone();

    let mut engine = Engine::new();
    engine.add_source(
        "main.strat",
        r#"
        schema vm { cloud string id }
        resource vm a { }
        output string t = tag(a.id)
        "#,
    )?;
    engine.add_extension(
        "tag".to_string(),
        1,
        Box::new(move |_| {
            c.set(c.get() + 1);
            Ok(Value::Null)
        }),
    )?;
    let results = engine.eval()?;
    assert!(results.outputs[0].value.is_undefined());
    assert_eq!(count.get(), 0);
    Ok(())
}

// A diamond of references (a -> b -> d, a -> c -> d) evaluates the shared
// instance once; later references read the memoized value.
#[test]
fn diamond_references_evaluate_the_shared_instance_once() -> Result<()> {
    let count = Rc::new(Cell::new(0usize));
    let c = count.clone();

    let mut engine = Engine::new();
    engine.add_source(
        "main.strat",
        r#"
        schema s { any v }
        resource s a { v = [b.v, c.v] }
        resource s b { v = d.v }
        resource s c { v = d.v }
        resource s d { v = label("d") }
        output any r = a.v
        "#,
    )?;
    engine.add_extension(
        "label".to_string(),
        1,
        Box::new(move |mut args| {
            c.set(c.get() + 1);
            let s = args.remove(0);
            Ok(Value::from(format!("label-{}", s.as_string()?)))
        }),
    )?;
    let results = engine.eval()?;
    assert_eq!(
        results.outputs[0].value,
        Value::from_json_str(r#"["label-d", "label-d"]"#)?
    );
    assert_eq!(count.get(), 1);
    Ok(())
}

#[test]
fn sensitive_outputs_are_masked_in_display() -> Result<()> {
    let mut engine = Engine::new();
    engine.add_source(
        "main.strat",
        r#"
        output string name = "corp"
        sensitive output string secret = "hunter2"
        "#,
    )?;
    let results = engine.eval()?;
    let rendered = results.to_string();
    assert!(rendered.contains("output string name = \"corp\""), "{rendered}");
    assert!(rendered.contains("output string secret = <sensitive value>"));
    assert!(!rendered.contains("hunter2"));

    // The value itself is still available to the host.
    assert_eq!(results.outputs[1].value, Value::from("hunter2"));
    assert!(results.outputs[1].sensitive);
    Ok(())
}

#[test]
fn duplicate_output_names_rejected() -> Result<()> {
    let mut engine = Engine::new();
    engine.add_source("main.strat", "output number n = 1 \n output number n = 2")?;
    let err = engine.eval().expect_err("duplicate output");
    assert!(matches!(
        err.downcast_ref::<EvalError>(),
        Some(EvalError::Duplicate(name)) if name == "n"
    ));
    Ok(())
}

#[test]
fn lookup_accepts_an_unrecorded_file_qualifier() -> Result<()> {
    let mut engine = Engine::new();
    engine.add_source(
        "main.strat",
        r#"
        schema vm { string name }
        resource vm web { name = "w" }
        "#,
    )?;
    engine.eval()?;
    let qualified = engine.lookup_instance("main.strat:vm.web")?;
    assert_eq!(qualified["name"], Value::from("w"));

    let err = engine.lookup_instance("vm.gone").expect_err("vm.gone");
    assert!(matches!(
        err.downcast_ref::<EvalError>(),
        Some(EvalError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn imports_bind_into_the_importing_file() -> Result<()> {
    let dir = temp_dir("import-plain");
    fs::write(
        dir.join("lib.strat"),
        r#"
        var prefix = "corp"
        fun describe(n) { return prefix + "-" + n }
        "#,
    )?;
    fs::write(
        dir.join("main.strat"),
        r#"
        import "lib.strat"
        output string d = describe("db")
        "#,
    )?;

    let mut engine = Engine::new();
    engine.add_source_from_file(dir.join("main.strat"))?;
    let results = engine.eval()?;
    assert_eq!(results.outputs[0].value, Value::from("corp-db"));
    assert_eq!(engine.cached_imports(), 1);
    Ok(())
}

#[test]
fn aliased_imports_bind_an_object() -> Result<()> {
    let dir = temp_dir("import-alias");
    fs::write(
        dir.join("lib.strat"),
        r#"
        var prefix = "corp"
        fun describe(n) { return prefix + "-" + n }
        "#,
    )?;
    fs::write(
        dir.join("main.strat"),
        r#"
        import "lib.strat" as lib
        output string p = lib.prefix
        output string d = lib.describe("db")
        "#,
    )?;

    let mut engine = Engine::new();
    engine.add_source_from_file(dir.join("main.strat"))?;
    let results = engine.eval()?;
    assert_eq!(results.outputs[0].value, Value::from("corp"));
    assert_eq!(results.outputs[1].value, Value::from("corp-db"));
    Ok(())
}

#[test]
fn circular_imports_are_cycles() -> Result<()> {
    let dir = temp_dir("import-cycle");
    fs::write(dir.join("a.strat"), "import \"b.strat\"\nvar a = 1")?;
    fs::write(dir.join("b.strat"), "import \"a.strat\"\nvar b = 2")?;
    fs::write(dir.join("main.strat"), "import \"a.strat\"")?;

    let mut engine = Engine::new();
    engine.add_source_from_file(dir.join("main.strat"))?;
    let err = engine.eval().expect_err("circular import");
    assert!(matches!(
        err.downcast_ref::<EvalError>(),
        Some(EvalError::Cycle { .. })
    ));
    Ok(())
}

// Two import paths to the same module must share one evaluation; a second
// evaluation would re-declare `widget` and fail.
#[test]
fn diamond_imports_evaluate_the_module_once() -> Result<()> {
    let dir = temp_dir("import-diamond");
    fs::write(
        dir.join("common.strat"),
        r#"
        schema widget { string name }
        var kind = "widget"
        output string hidden = "never recorded"
        "#,
    )?;
    fs::write(dir.join("a.strat"), "import \"common.strat\"\nvar a = kind")?;
    fs::write(dir.join("b.strat"), "import \"common.strat\"\nvar b = kind")?;
    fs::write(
        dir.join("main.strat"),
        r#"
        import "a.strat"
        import "b.strat"
        resource widget w { name = a + "/" + b }
        output string n = w.name
        "#,
    )?;

    let mut engine = Engine::new();
    engine.add_source_from_file(dir.join("main.strat"))?;
    let results = engine.eval()?;

    // Outputs of imported modules are not recorded.
    assert_eq!(results.outputs.len(), 1);
    assert_eq!(results.outputs[0].value, Value::from("widget/widget"));
    assert_eq!(engine.cached_imports(), 3);

    engine.clear_import_cache();
    assert_eq!(engine.cached_imports(), 0);
    Ok(())
}
