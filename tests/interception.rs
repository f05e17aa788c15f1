//! Patched modules under the interpreter: transparency, overrides with fallback and the
//! binding lifecycle.

mod common;

use std::{path::Path, rc::Rc};

use cilweave::{prelude::*, Error};
use common::*;

/// Patches the store closure in `dir` and loads the resulting files.
fn load_patched<'r>(registry: &'r CallRegistry, dir: &Path) -> Result<Interpreter<'r>> {
    let root = write_store_closure(dir);
    patch_closure(&root, PatchOptions::new().include_root(true))?;

    let mut interpreter = Interpreter::new(registry);
    interpreter.load_file(&root)?;
    interpreter.load_file(&store_path(dir))?;
    Ok(interpreter)
}

fn run(interpreter: &mut Interpreter<'_>) -> Result<Value> {
    interpreter.invoke("Store.Tests.Program::Run", None, vec![])
}

fn price(interpreter: &mut Interpreter<'_>, target: &Value) -> Result<Value> {
    interpreter.invoke("Store.PriceList::Price", Some(target.clone()), vec![Value::I32(5)])
}

#[test]
fn patched_code_behaves_like_the_original() -> Result<()> {
    let registry = CallRegistry::new();
    let mut original = Interpreter::new(&registry);
    original.load(store_tests_module())?;
    original.load(store_module())?;
    assert_eq!(run(&mut original)?, Value::I32(TOTAL_OF_100));

    let dir = tempfile::tempdir()?;
    let mut patched = load_patched(&registry, dir.path())?;
    assert_eq!(
        patched.invoke("Store.PriceList::Label", None, vec![])?,
        Value::from("standard")
    );
    assert_eq!(run(&mut patched)?, Value::I32(TOTAL_OF_100));

    // the prologue costs instructions, never results
    assert!(patched.instructions_executed() > original.instructions_executed());
    registry.teardown()
}

#[test]
fn static_override_falls_back_for_other_arguments() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = CallRegistry::new();
    let mut interpreter = load_patched(&registry, dir.path())?;

    let prices = Rc::new(Substitute::new());
    prices.returns("Tax", vec![Value::I32(100)], Value::I32(50));
    let price_list = interpreter.runtime_type(PRICE_LIST)?;
    let handle = substitute_static_for(&registry, price_list, prices.clone())?;

    // Run -> Checkout.Total(100) -> PriceList.Tax(100) is substituted
    assert_eq!(run(&mut interpreter)?, Value::I32(102 + 50));
    assert_eq!(
        interpreter.invoke("Store.PriceList::Tax", None, vec![Value::I32(70)])?,
        Value::I32(7)
    );
    assert_eq!(prices.received_count("Tax"), 2);
    assert_eq!(prices.received()[0].args, vec![Value::I32(100)]);

    handle.release()?;
    assert_eq!(run(&mut interpreter)?, Value::I32(TOTAL_OF_100));
    assert_eq!(prices.received_count("Tax"), 2);
    registry.teardown()
}

#[test]
fn default_policy_answers_unconfigured_calls() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = CallRegistry::new();
    let mut interpreter = load_patched(&registry, dir.path())?;

    let checkout = interpreter.runtime_type(CHECKOUT)?;
    let handle = substitute_static_for(
        &registry,
        checkout,
        Rc::new(Substitute::with_unconfigured(Unconfigured::ReturnDefault)),
    )?;
    assert_eq!(run(&mut interpreter)?, Value::I32(0));

    handle.release()?;
    registry.teardown()
}

#[test]
fn closures_can_route_calls() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = CallRegistry::new();
    let mut interpreter = load_patched(&registry, dir.path())?;

    let router = |call: &Call| match call.args() {
        [Value::I32(amount)] if call.method().name == "Tax" => Value::I32(amount / 4),
        _ => {
            call.call_original();
            Value::Null
        }
    };
    let price_list = interpreter.runtime_type(PRICE_LIST)?;
    let handle = substitute_static_for(&registry, price_list, Rc::new(router))?;

    assert_eq!(run(&mut interpreter)?, Value::I32(102 + 25));
    handle.release()?;
    registry.teardown()
}

#[test]
fn instance_substitution_only_affects_the_mock() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = CallRegistry::new();
    let mut interpreter = load_patched(&registry, dir.path())?;

    let prices = Rc::new(Substitute::new());
    prices.returns_for_any_args("Price", Value::I32(1000));
    let (mock, handle) = interpreter.substitute_instance_for(PRICE_LIST, vec![], prices.clone())?;
    assert_eq!(
        interpreter.type_of(&mock).map(|ty| ty.name.as_str()),
        Some(PRICE_LIST)
    );

    assert_eq!(price(&mut interpreter, &mock)?, Value::I32(1000));

    let real = interpreter.new_object(PRICE_LIST, vec![])?;
    assert_eq!(price(&mut interpreter, &real)?, Value::I32(7));

    // Checkout builds its own price list, which is not substituted
    assert_eq!(run(&mut interpreter)?, Value::I32(TOTAL_OF_100));

    assert_eq!(prices.received().len(), 1);
    assert_eq!(prices.received()[0].instance, mock.as_object());

    handle.release()?;
    registry.teardown()
}

#[test]
fn instance_substitution_rejects_constructor_arguments() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = CallRegistry::new();
    let mut interpreter = load_patched(&registry, dir.path())?;

    let outcome =
        interpreter.substitute_instance_for(PRICE_LIST, vec![Value::I32(1)], Rc::new(Substitute::new()));
    assert!(matches!(outcome, Err(Error::Substitute(_))));
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn binding_lifecycle_errors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = CallRegistry::new();
    let interpreter = load_patched(&registry, dir.path())?;
    let price_list = interpreter.runtime_type(PRICE_LIST)?;

    let handle = substitute_static_for(&registry, price_list.clone(), Rc::new(Substitute::new()))?;
    assert!(matches!(
        substitute_static_for(&registry, price_list.clone(), Rc::new(Substitute::new())),
        Err(Error::DuplicateBinding(_))
    ));

    match registry.teardown() {
        Err(Error::LeakDetected(targets)) => assert_eq!(targets, vec![PRICE_LIST.to_string()]),
        other => panic!("expected a leak, got {other:?}"),
    }

    handle.release()?;
    assert!(matches!(handle.release(), Err(Error::UnbalancedDispose(_))));

    // the type can be bound again once released
    let again = substitute_static_for(&registry, price_list, Rc::new(Substitute::new()))?;
    again.release()?;
    registry.teardown()
}

#[test]
fn by_ref_arguments_reach_the_caller_variable() -> Result<()> {
    let registry = CallRegistry::new();
    let mut original = Interpreter::new(&registry);
    original.load(store_module())?;
    assert_eq!(
        original.invoke("Store.Counter::Seven", None, vec![])?,
        Value::I32(7)
    );

    let dir = tempfile::tempdir()?;
    let mut patched = load_patched(&registry, dir.path())?;
    assert_eq!(
        patched.invoke("Store.Counter::Seven", None, vec![])?,
        Value::I32(7)
    );

    // the prologue of Peek packs the referenced value, not the address
    let counter = Rc::new(Substitute::new());
    let counter_type = patched.runtime_type(COUNTER)?;
    let handle = substitute_static_for(&registry, counter_type, counter.clone())?;
    assert_eq!(
        patched.invoke("Store.Counter::Seven", None, vec![])?,
        Value::I32(7)
    );
    let peek = counter
        .received()
        .into_iter()
        .find(|call| call.method == "Peek")
        .expect("Peek was routed");
    assert_eq!(peek.args, vec![Value::I32(7)]);

    handle.release()?;
    registry.teardown()
}
