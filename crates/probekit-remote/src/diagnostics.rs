//! Tests and activators linked into `probekit-host`, used to check what a
//! forked runtime actually sees.

use probekit_core::{Catalog, TestContext, TestFailure};
use serde_json::Value;

pub const ENVIRONMENT_TEST: &str = "probekit.diagnostics.EnvironmentTest";
pub const PROPERTY_TEST: &str = "probekit.diagnostics.PropertyTest";
pub const FAILING_TEST: &str = "probekit.diagnostics.FailingTest";

/// `variable_equals(name, expected)`; a null `expected` means unset.
pub const METHOD_VARIABLE_EQUALS: &str = "variable_equals";
/// `property_equals(key, expected)` against the runtime's properties.
pub const METHOD_PROPERTY_EQUALS: &str = "property_equals";
pub const METHOD_FAILS: &str = "fails";
pub const METHOD_PANICS: &str = "panics";

/// Activator refusing to start unless the variable named by the
/// [`REQUIRED_VARIABLE_PROPERTY`] runtime property is set.
pub const REQUIRED_VARIABLE_ACTIVATOR: &str = "probekit.diagnostics.RequiredVariable";
pub const REQUIRED_VARIABLE_PROPERTY: &str = "probekit.diagnostics.required.variable";

fn string_arg(ctx: &TestContext, index: usize) -> Result<String, TestFailure> {
    ctx.arguments
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TestFailure::new("arguments", format!("argument {index} must be a string")))
}

fn expect_equal(what: &str, actual: Option<String>, expected: Option<&str>) -> Result<(), TestFailure> {
    if actual.as_deref() == expected {
        Ok(())
    } else {
        Err(TestFailure::assertion(format!(
            "{what}: expected {expected:?}, found {actual:?}"
        )))
    }
}

fn variable_equals(ctx: &TestContext) -> Result<(), TestFailure> {
    let name = string_arg(ctx, 0)?;
    let expected = ctx.arguments.get(1).and_then(Value::as_str);
    expect_equal(&name, std::env::var(&name).ok(), expected)
}

fn property_equals(ctx: &TestContext) -> Result<(), TestFailure> {
    let key = string_arg(ctx, 0)?;
    let expected = ctx.arguments.get(1).and_then(Value::as_str);
    expect_equal(&key, ctx.property(&key).map(str::to_string), expected)
}

pub fn catalog() -> Catalog {
    Catalog::new()
        .with_test(ENVIRONMENT_TEST, METHOD_VARIABLE_EQUALS, variable_equals)
        .with_test(PROPERTY_TEST, METHOD_PROPERTY_EQUALS, property_equals)
        .with_test(FAILING_TEST, METHOD_FAILS, |ctx| {
            let message = ctx
                .arguments
                .first()
                .and_then(Value::as_str)
                .unwrap_or("failing on purpose");
            Err(TestFailure::assertion(message))
        })
        .with_test(FAILING_TEST, METHOD_PANICS, |_| panic!("panicking on purpose"))
        .with_activator(REQUIRED_VARIABLE_ACTIVATOR, |ctx| {
            match ctx.property(REQUIRED_VARIABLE_PROPERTY) {
                Some(name) if std::env::var(name).is_err() => Err(format!("{name} is not set")),
                _ => Ok(()),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use probekit_core::TestInstantiationInstruction;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn run(owner: &str, method: &str, ctx: TestContext) -> Result<(), TestFailure> {
        let instruction = TestInstantiationInstruction::new(owner, method).unwrap();
        let test = catalog().test(&instruction).unwrap();
        test(&ctx)
    }

    #[test]
    fn test_property_equals() {
        let ctx = TestContext {
            arguments: vec![json!("acme.region"), json!("eu")],
            properties: BTreeMap::from([("acme.region".to_string(), "eu".to_string())]),
        };
        assert!(run(PROPERTY_TEST, METHOD_PROPERTY_EQUALS, ctx.clone()).is_ok());

        let ctx = TestContext {
            arguments: vec![json!("acme.region"), json!("us")],
            ..ctx
        };
        let failure = run(PROPERTY_TEST, METHOD_PROPERTY_EQUALS, ctx).unwrap_err();
        assert_eq!(failure.kind, "assertion");
    }

    #[test]
    fn test_unset_variable_matches_null() {
        let ctx = TestContext {
            arguments: vec![json!("PROBEKIT_DIAGNOSTICS_NEVER_SET"), Value::Null],
            ..Default::default()
        };
        assert!(run(ENVIRONMENT_TEST, METHOD_VARIABLE_EQUALS, ctx).is_ok());
    }

    #[test]
    fn test_bad_arguments_are_reported() {
        let failure = run(ENVIRONMENT_TEST, METHOD_VARIABLE_EQUALS, TestContext::default()).unwrap_err();
        assert_eq!(failure.kind, "arguments");
    }
}
