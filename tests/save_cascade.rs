//! Cascading saves: durability, empty-save elision, retry after a root
//! commit failure, and confinement enforcement.

mod common;

use std::sync::mpsc;

use common::FlakyStore;
use stratum::error::StackError;
use stratum::predicate::Predicate;
use stratum::save::save_and_wait;
use stratum::schema::{EntityDescriptor, Schema};
use stratum::stack::DataStack;
use stratum::store::ObjectStore;
use stratum::types::{EntityName, Fields, Value};

fn schema() -> Schema {
    Schema::builder()
        .entity(EntityDescriptor::new("person").primary_key("remoteID"))
        .build()
}

fn person() -> EntityName {
    EntityName::from("person")
}

#[test]
fn save_without_changes_performs_no_store_io() {
    let store = FlakyStore::new(&schema());
    let stack = DataStack::with_store(schema(), store.clone());

    stack.save_and_wait().unwrap();
    let bg = stack.background_context();
    save_and_wait(&bg).unwrap();

    assert_eq!(store.commit_count(), 0);
}

#[test]
fn root_failure_keeps_originator_dirty_and_save_is_retryable() {
    let store = FlakyStore::new(&schema());
    let stack = DataStack::with_store(schema(), store.clone());

    let bg = stack.background_context();
    let id = bg
        .create(&person(), {
            let mut f = Fields::new();
            f.insert("name".into(), Value::Text("A".into()));
            f
        })
        .unwrap();

    store.fail_applies(true);
    let err = save_and_wait(&bg);
    assert!(matches!(err, Err(StackError::CommitFailed { .. })));
    // The failed cascade must not have consumed the pending work.
    assert!(bg.has_changes());

    store.fail_applies(false);
    save_and_wait(&bg).unwrap();
    assert!(!bg.has_changes());

    // Retrying replays the batch; merge semantics keep it idempotent.
    assert_eq!(store.scan(&person()).unwrap().len(), 1);
    let row = store.get(&person(), id).unwrap().unwrap();
    assert_eq!(row.get("name"), Some(&Value::Text("A".into())));
}

#[test]
fn temporary_context_commit_is_one_level_only() {
    let store = FlakyStore::new(&schema());
    let stack = DataStack::with_store(schema(), store.clone());

    let temp = stack.temporary_context();
    let id = temp.create(&person(), Fields::new()).unwrap();
    temp.commit_local().unwrap();

    // Main sees it, the store does not.
    assert!(stack.main_context().get(&person(), id).unwrap().is_some());
    assert_eq!(store.commit_count(), 0);

    stack.save_and_wait().unwrap();
    assert!(store.get(&person(), id).unwrap().is_some());
}

#[test]
fn saved_background_work_is_visible_to_main() {
    let store = FlakyStore::new(&schema());
    let stack = DataStack::with_store(schema(), store);

    let bg = stack.background_context();
    bg.create(&person(), Fields::new()).unwrap();
    save_and_wait(&bg).unwrap();

    assert_eq!(
        stack.main_context().count(&person(), Predicate::All).unwrap(),
        1
    );
}

#[test]
fn main_sees_background_update_to_its_own_saved_object() {
    let store = FlakyStore::new(&schema());
    let stack = DataStack::with_store(schema(), store);

    let main = stack.main_context().clone();
    let id = main
        .create(&person(), {
            let mut f = Fields::new();
            f.insert("name".into(), Value::Text("A".into()));
            f
        })
        .unwrap();
    stack.save_and_wait().unwrap();

    stack.perform_background(
        move |ctx| ctx.set(&person(), id, "name", Value::Text("B".into())),
        |r| r.unwrap(),
    );
    stack.drain_background();

    let row = main.get(&person(), id).unwrap().unwrap();
    assert_eq!(row.get("name"), Some(&Value::Text("B".into())));
}

#[test]
fn main_sees_background_delete_of_its_own_saved_object() {
    let store = FlakyStore::new(&schema());
    let stack = DataStack::with_store(schema(), store);

    let main = stack.main_context().clone();
    let id = main.create(&person(), Fields::new()).unwrap();
    stack.save_and_wait().unwrap();

    stack.perform_background(
        move |ctx| ctx.delete(&person(), id),
        |r| r.unwrap(),
    );
    stack.drain_background();

    assert!(main.get(&person(), id).unwrap().is_none());
    assert_eq!(main.count(&person(), Predicate::All).unwrap(), 0);
}

#[test]
fn async_save_frees_the_originating_queue_during_the_store_write() {
    let store = FlakyStore::new(&schema());
    let stack = DataStack::with_store(schema(), store.clone());

    let main = stack.main_context().clone();
    main.create(&person(), Fields::new()).unwrap();

    store.hold_applies(true);
    let (tx, rx) = mpsc::channel();
    stack.save(false, move |result| {
        let _ = tx.send(result);
    });

    // The durable write is parked on the writer's queue; main must keep
    // servicing work meanwhile.
    main.create(&person(), Fields::new()).unwrap();
    assert!(main.has_changes());

    store.hold_applies(false);
    rx.recv().unwrap().unwrap();
}

#[test]
#[should_panic(expected = "caller-confined")]
fn caller_confined_context_cannot_cascade() {
    let store = FlakyStore::new(&schema());
    let stack = DataStack::with_store(schema(), store);

    let ctx = stack.caller_confined_context();
    ctx.create(&person(), Fields::new()).unwrap();
    let _ = save_and_wait(&ctx);
}
