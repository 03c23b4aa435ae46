// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use stratus::{Number, Value};

#[test]
fn json_round_trip() -> Result<()> {
    let v = Value::from_json_str(r#"{"a": [1, 2.5, "x"], "b": null, "c": true}"#)?;
    let obj = v.as_object()?;
    assert_eq!(obj.len(), 3);
    assert_eq!(v["a"][0], Value::from(1u64));
    assert_eq!(v["a"][1], Value::from(2.5));
    assert_eq!(v["a"][2], Value::from("x"));
    assert!(v["b"].is_null());
    assert_eq!(v["c"], Value::from(true));

    let back = Value::from_json_str(&v.to_string())?;
    assert_eq!(back, v);
    Ok(())
}

#[test]
fn whole_floats_collapse_to_integers() {
    assert_eq!(Value::from(2.0), Value::from(2i64));
    assert_eq!(Number::from(1e3), Number::from(1000u64));
    assert_ne!(Value::from(2.5), Value::from(2i64));
}

#[test]
fn missing_lookups_yield_undefined() {
    let v = Value::from_json_str(r#"{"a": [10]}"#).unwrap();
    assert!(v["nope"].is_undefined());
    assert!(v["a"][7].is_undefined());
    assert!(v["a"]["x"].is_undefined());
    assert!(Value::Null["a"].is_undefined());
}

#[test]
fn type_names() {
    assert_eq!(Value::Null.type_name(), "null");
    assert_eq!(Value::from(false).type_name(), "bool");
    assert_eq!(Value::from(3i64).type_name(), "number");
    assert_eq!(Value::from("s").type_name(), "string");
    assert_eq!(Value::new_array().type_name(), "array");
    assert_eq!(Value::new_object().type_name(), "object");
    assert_eq!(Value::Undefined.type_name(), "undefined");
}

#[test]
fn undefined_serializes_as_marker_string() {
    let mut obj = Value::new_object();
    obj.as_object_mut()
        .unwrap()
        .insert(Value::from("ep"), Value::Undefined);
    assert_eq!(obj.to_string(), r#"{"ep":"<undefined>"}"#);
}

#[test]
fn non_string_keys_serialize_as_json_text() {
    let mut obj = Value::new_object();
    obj.as_object_mut()
        .unwrap()
        .insert(Value::from(0i64), Value::from("first"));
    assert_eq!(obj.to_string(), r#"{"0":"first"}"#);
}

#[test]
fn make_or_get_value_mut_creates_nested_objects() -> Result<()> {
    let mut v = Value::new_object();
    *v.make_or_get_value_mut(&["a", "b"])? = Value::from(1i64);
    assert_eq!(v["a"]["b"], Value::from(1i64));

    // Existing slots are reused, not clobbered.
    *v.make_or_get_value_mut(&["a", "c"])? = Value::from(2i64);
    assert_eq!(v["a"]["b"], Value::from(1i64));
    assert_eq!(v["a"]["c"], Value::from(2i64));
    Ok(())
}

#[test]
fn as_accessors_reject_other_kinds() {
    assert!(Value::from("s").as_number().is_err());
    assert!(Value::from(1i64).as_string().is_err());
    assert!(Value::new_array().as_object().is_err());
    assert!(Value::from(2.5).as_i64().is_err());
    assert_eq!(Value::from(7i64).as_i64().unwrap(), 7);
}
