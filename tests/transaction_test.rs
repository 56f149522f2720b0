use std::sync::mpsc;
use std::thread;

use docvault::{
    ActionRegistry, DocVault, Error, ExecutionContext, IndexDefinition, Query, SortOrder,
    TransactionDescriptor, TxStatus, VaultOptions,
};
use proptest::prelude::*;
use serde_json::{json, Value};

fn vault_with(names: &[&str]) -> DocVault {
    let vault = DocVault::in_memory();
    for name in names {
        vault.create_collection(name).unwrap();
    }
    vault
}

/// Collection contents as comparable JSON, system attributes included.
fn contents(vault: &DocVault, collection: &str) -> Vec<Value> {
    vault.all(collection).unwrap()
}

fn registry() -> ActionRegistry {
    let mut r = ActionRegistry::new();
    r.register("function () { return 1; }", |_, _| Ok(json!(1)));
    r.register("function (params) { return params; }", |_, params| {
        Ok(params.cloned().unwrap_or(Value::Null))
    });
    r
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

#[test]
fn invalid_invocations_are_bad_parameters() {
    let vault = vault_with(&["c"]);
    let ctx = vault.context();
    let registry = registry();
    let cases = [
        json!(null),
        json!(true),
        json!(1),
        json!("foo"),
        json!([]),
        json!({}),
        json!({"collections": true, "action": "function () { return 1; }"}),
        json!({"collections": {"read": 1}, "action": "function () { return 1; }"}),
        json!({"collections": {"write": [1]}, "action": "function () { return 1; }"}),
        json!({"collections": {}}),
        json!({"collections": {}, "action": true}),
        json!({"collections": {}, "action": "return 1"}),
        json!({"collections": {}, "action": "function () { return 1; }", "lockTimeout": -1}),
        json!({"collections": {}, "action": "function () { return 1; }", "lockTimeout": "5"}),
    ];
    for raw in cases {
        let err = ctx.run_json(&raw, &registry).unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)), "{raw} gave {err}");
        assert_eq!(err.code(), 10);
    }
}

#[test]
fn empty_transaction_returns_action_value() {
    let vault = vault_with(&[]);
    let out = vault
        .context()
        .run_json(
            &json!({"collections": {}, "action": "function () { return 1; }"}),
            &registry(),
        )
        .unwrap();
    assert_eq!(out, json!(1));
    // nothing was written, so nothing was logged
    assert_eq!(vault.count("_trx").unwrap(), 0);
}

#[test]
fn params_are_passed_through() {
    let vault = vault_with(&[]);
    let ctx = vault.context();
    for params in [json!([1, 2, 3]), json!({"a": {"b": null}}), json!("x"), json!(4.5)] {
        let raw = json!({
            "collections": {},
            "action": "function (params) { return params; }",
            "params": params.clone(),
        });
        assert_eq!(ctx.run_json(&raw, &registry()).unwrap(), params);
    }
}

#[test]
fn return_values_are_returned_unchanged() {
    let vault = vault_with(&[]);
    for value in [
        json!(null),
        json!(false),
        json!(-3.25),
        json!("text"),
        json!([1, [2, {"x": null}]]),
        json!({"nested": {"list": [true, 0]}}),
    ] {
        let expected = value.clone();
        let out = vault
            .transaction(TransactionDescriptor::new(move |_, _| Ok(value)))
            .unwrap();
        assert_eq!(out, expected);
    }
}

#[test]
fn unknown_collections_are_rejected_before_running() {
    let vault = vault_with(&["c"]);
    for descriptor in [
        TransactionDescriptor::new(|_, _| Ok(json!(1))).read("missing"),
        TransactionDescriptor::new(|_, _| Ok(json!(1))).write("missing"),
        TransactionDescriptor::new(|_, _| Ok(json!(1))).read("c").write("missing"),
    ] {
        let err = vault.transaction(descriptor).unwrap_err();
        assert!(matches!(err, Error::CollectionNotFound(ref n) if n == "missing"));
        assert_eq!(err.code(), 1203);
    }
}

#[test]
fn transaction_log_is_read_only() {
    let vault = vault_with(&["c"]);
    let err = vault
        .transaction(TransactionDescriptor::new(|_, _| Ok(json!(1))).write("_trx"))
        .unwrap_err();
    assert!(matches!(err, Error::DisallowedOperation(_)));

    vault.insert("c", json!({"a": 1})).unwrap();
    let count = vault
        .transaction(
            TransactionDescriptor::new(|tx, _| Ok(json!(tx.count("_trx")?))).read("_trx"),
        )
        .unwrap();
    assert_eq!(count, json!(1));
}

// ---------------------------------------------------------------------------
// Lock set enforcement
// ---------------------------------------------------------------------------

#[test]
fn undeclared_write_aborts_and_rolls_back() {
    let vault = vault_with(&["a", "b"]);
    let err = vault
        .transaction(
            TransactionDescriptor::new(|tx, _| {
                tx.insert("a", json!({"_key": "one"}))?;
                tx.insert("b", json!({"_key": "two"}))?;
                Ok(Value::Null)
            })
            .write("a"),
        )
        .unwrap_err();
    assert!(matches!(err, Error::UnregisteredCollection(ref n) if n == "b"));
    assert_eq!(vault.count("a").unwrap(), 0);
    assert_eq!(vault.count("b").unwrap(), 0);
}

#[test]
fn read_declaration_does_not_allow_writes() {
    let vault = vault_with(&["a"]);
    let err = vault
        .transaction(
            TransactionDescriptor::new(|tx, _| {
                tx.truncate("a")?;
                Ok(Value::Null)
            })
            .read("a"),
        )
        .unwrap_err();
    assert!(matches!(err, Error::UnregisteredCollection(_)));
}

#[test]
fn implicit_reads_follow_configuration() {
    let vault = vault_with(&["a", "b"]);
    vault.insert("b", json!({"_key": "k"})).unwrap();

    let read_b = |allow: Option<bool>| {
        let mut d = TransactionDescriptor::new(|tx, _| tx.document("b", "k")).write("a");
        if let Some(allow) = allow {
            d = d.allow_implicit(allow);
        }
        vault.transaction(d)
    };
    assert_eq!(read_b(None).unwrap()["_key"], "k");
    assert!(matches!(read_b(Some(false)), Err(Error::UnregisteredCollection(_))));

    let strict = DocVault::open(VaultOptions {
        allow_implicit_collections: false,
        ..VaultOptions::in_memory()
    })
    .unwrap();
    strict.create_collection("b").unwrap();
    let err = strict
        .transaction(TransactionDescriptor::new(|tx, _| Ok(json!(tx.count("b")?))))
        .unwrap_err();
    assert!(matches!(err, Error::UnregisteredCollection(_)));
}

#[test]
fn implicit_read_of_missing_collection_reports_not_found() {
    let vault = vault_with(&[]);
    let err = vault
        .transaction(TransactionDescriptor::new(|tx, _| Ok(json!(tx.count("nope")?))))
        .unwrap_err();
    assert!(matches!(err, Error::CollectionNotFound(_)));
}

// ---------------------------------------------------------------------------
// Operations and rollback
// ---------------------------------------------------------------------------

#[test]
fn reads_see_own_writes() {
    let vault = vault_with(&["c"]);
    let out = vault
        .transaction(
            TransactionDescriptor::new(|tx, _| {
                tx.insert("c", json!({"_key": "a", "v": 1}))?;
                tx.insert("c", json!({"_key": "b", "v": 2}))?;
                tx.update("c", "a", json!({"v": 10, "w": true}))?;
                tx.replace("c", "b", json!({"z": 0}))?;
                tx.remove("c", "b")?;
                Ok(json!({
                    "count": tx.count("c")?,
                    "a": tx.document("c", "a")?,
                    "b": tx.exists("c", "b")?,
                }))
            })
            .write("c"),
        )
        .unwrap();
    assert_eq!(out["count"], 1);
    assert_eq!(out["a"]["v"], 10);
    assert_eq!(out["a"]["w"], true);
    assert_eq!(out["b"], false);
    assert_eq!(vault.document("c", "a").unwrap()["v"], 10);
}

#[test]
fn rollback_restores_documents_and_revision() {
    let vault = vault_with(&["c"]);
    vault.insert("c", json!({"_key": "keep", "v": 1})).unwrap();
    let before = contents(&vault, "c");
    let revision = vault.revision("c").unwrap();

    let err = vault
        .transaction(
            TransactionDescriptor::new(|tx, _| {
                tx.insert("c", json!({"_key": "new"}))?;
                tx.update("c", "keep", json!({"v": 2}))?;
                tx.truncate("c")?;
                tx.insert("c", json!({"_key": "again"}))?;
                Err(Error::Rollback(json!("stop")))
            })
            .write("c"),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Rollback(ref v) if v == "stop"));
    assert_eq!(contents(&vault, "c"), before);
    assert_eq!(vault.revision("c").unwrap(), revision);
    assert_eq!(vault.count("c").unwrap(), 1);
}

#[test]
fn repeated_truncates_roll_back() {
    let vault = vault_with(&["c"]);
    for i in 0..5 {
        vault.insert("c", json!({"_key": format!("k{i}"), "i": i})).unwrap();
    }
    let before = contents(&vault, "c");
    let result = vault.transaction(
        TransactionDescriptor::new(|tx, _| {
            tx.truncate("c")?;
            tx.insert("c", json!({"_key": "x"}))?;
            assert_eq!(tx.truncate("c")?, 1);
            assert_eq!(tx.truncate("c")?, 0);
            Err(Error::Rollback(Value::Null))
        })
        .write("c"),
    );
    assert!(result.is_err());
    assert_eq!(contents(&vault, "c"), before);
}

#[test]
fn unique_violation_aborts_the_transaction() {
    let vault = vault_with(&["c"]);
    vault
        .ensure_index("c", &IndexDefinition::unique_hash(&["email"]))
        .unwrap();
    vault.insert("c", json!({"email": "a@x"})).unwrap();
    let err = vault
        .transaction(
            TransactionDescriptor::new(|tx, _| {
                tx.insert("c", json!({"email": "b@x"}))?;
                tx.insert("c", json!({"email": "a@x"}))?;
                Ok(Value::Null)
            })
            .write("c"),
        )
        .unwrap_err();
    assert!(matches!(err, Error::UniqueConstraintViolated { .. }));
    assert_eq!(err.code(), 1210);
    assert_eq!(vault.count("c").unwrap(), 1);
    // the rolled back value is free again
    vault.insert("c", json!({"email": "b@x"})).unwrap();
}

#[test]
fn duplicate_key_is_a_unique_violation() {
    let vault = vault_with(&["c"]);
    vault.insert("c", json!({"_key": "k"})).unwrap();
    let err = vault.insert("c", json!({"_key": "k"})).unwrap_err();
    assert!(matches!(err, Error::UniqueConstraintViolated { ref field, .. } if field == "_key"));
}

#[test]
fn cap_rollback_keeps_eviction_order() {
    let vault = vault_with(&["c"]);
    vault.ensure_index("c", &IndexDefinition::cap(3)).unwrap();
    for key in ["a", "b", "c"] {
        vault.insert("c", json!({"_key": key})).unwrap();
    }
    let before = contents(&vault, "c");

    let result = vault.transaction(
        TransactionDescriptor::new(|tx, _| {
            for key in ["d", "e", "f", "g"] {
                tx.insert("c", json!({"_key": key}))?;
            }
            assert_eq!(tx.count("c")?, 3);
            Err(Error::Rollback(Value::Null))
        })
        .write("c"),
    );
    assert!(result.is_err());
    assert_eq!(contents(&vault, "c"), before);

    // the oldest survivor is still evicted first
    vault.insert("c", json!({"_key": "h"})).unwrap();
    let keys: Vec<Value> = contents(&vault, "c").iter().map(|d| d["_key"].clone()).collect();
    assert_eq!(keys, [json!("b"), json!("c"), json!("h")]);
}

#[test]
fn writes_span_collections_atomically() {
    let vault = vault_with(&["from", "to"]);
    vault.insert("from", json!({"_key": "acct", "balance": 10})).unwrap();
    let transfer = |amount: i64| {
        vault.transaction(
            TransactionDescriptor::new(move |tx, _| {
                let doc = tx.document("from", "acct")?;
                let balance = doc["balance"].as_i64().unwrap_or(0) - amount;
                tx.update("from", "acct", json!({"balance": balance}))?;
                tx.insert("to", json!({"amount": amount}))?;
                if balance < 0 {
                    return Err(Error::Rollback(json!("insufficient funds")));
                }
                Ok(json!(balance))
            })
            .write("from")
            .write("to"),
        )
    };
    assert_eq!(transfer(4).unwrap(), json!(6));
    assert!(transfer(7).is_err());
    assert_eq!(vault.document("from", "acct").unwrap()["balance"], 6);
    assert_eq!(vault.count("to").unwrap(), 1);
}

#[test]
fn committed_transactions_are_summarised() {
    let vault = vault_with(&["a", "b"]);
    vault
        .transaction(
            TransactionDescriptor::new(|tx, _| {
                tx.insert("a", json!({}))?;
                tx.insert("a", json!({}))?;
                Ok(Value::Null)
            })
            .read("b")
            .write("a"),
        )
        .unwrap();
    let log = vault.all("_trx").unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0]["status"], "committed");
    assert_eq!(log[0]["operations"], 2);
    assert_eq!(log[0]["collections"]["read"], json!(["b"]));
    assert_eq!(log[0]["collections"]["write"], json!(["a"]));
}

// ---------------------------------------------------------------------------
// Nesting and schema operations
// ---------------------------------------------------------------------------

#[test]
fn nested_transactions_are_rejected() {
    let vault = vault_with(&["c"]);
    let ctx = vault.context();
    let out = ctx
        .run(
            TransactionDescriptor::new(|tx, _| {
                let inner = tx
                    .context()
                    .run(TransactionDescriptor::new(|_, _| Ok(json!("inner"))));
                assert!(matches!(inner, Err(Error::NestedTransaction)));
                let raw = json!({"collections": {}, "action": "function () { return 1; }"});
                let inner = tx.context().run_json(&raw, &registry());
                assert!(matches!(inner, Err(Error::NestedTransaction)));
                tx.insert("c", json!({"_key": "outer"}))?;
                Ok(json!("outer"))
            })
            .write("c"),
        )
        .unwrap();
    assert_eq!(out, json!("outer"));
    assert!(!ctx.in_transaction());
    assert_eq!(vault.document("c", "outer").unwrap()["_key"], "outer");
}

#[test]
fn vault_calls_inside_an_action_are_refused() {
    let vault = vault_with(&["c", "other"]);
    let v = &vault;
    let err = vault
        .transaction(
            TransactionDescriptor::new(move |tx, _| {
                tx.insert("c", json!({"_key": "mine"}))?;
                assert!(v.in_action());

                let disallowed = |r: Result<(), Error>| matches!(r, Err(Error::DisallowedOperation(_)));
                assert!(disallowed(v.create_collection("sneaky")));
                assert!(disallowed(v.drop_collection("other")));
                assert!(disallowed(v.rename_collection("other", "renamed")));
                assert!(disallowed(v.set_wait_for_sync("other", true)));
                assert!(disallowed(v.checkpoint()));
                assert!(matches!(
                    v.ensure_index("other", &IndexDefinition::hash(&["a"])),
                    Err(Error::DisallowedOperation(_))
                ));
                assert!(matches!(v.drop_index("other", "other/1"), Err(Error::DisallowedOperation(_))));
                assert!(disallowed(tx.context().vault().create_collection("sneaky")));

                assert!(matches!(
                    v.insert("other", json!({"_key": "x"})),
                    Err(Error::NestedTransaction)
                ));
                assert!(matches!(v.count("c"), Err(Error::NestedTransaction)));
                assert!(matches!(v.query(&Query::for_in("other")), Err(Error::NestedTransaction)));
                let inner = v.transaction(TransactionDescriptor::new(|_, _| Ok(json!(1))));
                assert!(matches!(inner, Err(Error::NestedTransaction)));
                let raw = json!({"collections": {}, "action": "function () { return 1; }"});
                assert!(matches!(
                    v.context().run_json(&raw, &registry()),
                    Err(Error::NestedTransaction)
                ));
                Err(Error::Rollback(Value::Null))
            })
            .write("c"),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Rollback(_)));

    assert!(!vault.in_action());
    assert!(!vault.has_collection("sneaky"));
    assert!(vault.indexes("other").unwrap().is_empty());
    assert_eq!(vault.count("other").unwrap(), 0);
    assert_eq!(vault.count("c").unwrap(), 0);
    // usable again once the action is over
    vault.create_collection("later").unwrap();
}

#[test]
fn schema_operations_are_disallowed_inside() {
    let vault = vault_with(&["c"]);
    let ctx = vault.context();
    ctx.run(
        TransactionDescriptor::new(|tx, _| {
            let hash = IndexDefinition::hash(&["a"]);
            let disallowed = |r: Result<(), Error>| matches!(r, Err(Error::DisallowedOperation(_)));
            assert!(disallowed(tx.create_collection("x")));
            assert!(disallowed(tx.drop_collection("c")));
            assert!(disallowed(tx.rename_collection("c", "d")));
            assert!(disallowed(tx.ensure_index("c", &hash)));
            assert!(disallowed(tx.drop_index("c", "c/1")));

            let ctx: &ExecutionContext<'_> = tx.context();
            assert!(matches!(ctx.create_collection("x"), Err(Error::DisallowedOperation(_))));
            assert!(matches!(ctx.drop_collection("c"), Err(Error::DisallowedOperation(_))));
            assert!(matches!(ctx.rename_collection("c", "d"), Err(Error::DisallowedOperation(_))));
            for def in [
                hash.clone(),
                IndexDefinition::unique_skiplist(&["a"]),
                IndexDefinition::fulltext("text"),
                IndexDefinition::geo(&["lat", "lon"]),
                IndexDefinition::cap(10),
                IndexDefinition::priority_queue("p"),
            ] {
                assert!(matches!(ctx.ensure_index("c", &def), Err(Error::DisallowedOperation(_))));
            }
            assert!(matches!(ctx.drop_index("c", "c/1"), Err(Error::DisallowedOperation(_))));
            Ok(Value::Null)
        })
        .write("c"),
    )
    .unwrap();
    assert!(!vault.has_collection("x"));
    assert!(vault.has_collection("c"));
    assert!(vault.indexes("c").unwrap().is_empty());

    // outside a transaction the same context may change the schema
    ctx.create_collection("x").unwrap();
}

#[test]
fn unsupported_index_kinds_outside_transactions() {
    let vault = vault_with(&["c"]);
    for def in [IndexDefinition::geo(&["lat", "lon"]), IndexDefinition::priority_queue("p")] {
        assert!(matches!(vault.ensure_index("c", &def), Err(Error::UnsupportedIndex(_))));
    }
}

#[test]
fn a_panicking_action_rolls_back() {
    let vault = vault_with(&["c"]);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = vault.transaction(
            TransactionDescriptor::new(|tx, _| {
                tx.insert("c", json!({"_key": "ghost"}))?;
                panic!("action failed");
            })
            .write("c"),
        );
    }));
    assert!(result.is_err());
    assert!(!vault.in_action());
    assert_eq!(vault.count("c").unwrap(), 0);
}

#[test]
fn status_is_running_inside_the_action() {
    let vault = vault_with(&[]);
    vault
        .transaction(TransactionDescriptor::new(|tx, _| {
            assert_eq!(tx.status(), TxStatus::Running);
            assert_eq!(tx.context().current_transaction(), Some(tx.id()));
            Ok(Value::Null)
        }))
        .unwrap();
}

// ---------------------------------------------------------------------------
// Locking across threads
// ---------------------------------------------------------------------------

#[test]
fn zero_lock_timeout_fails_fast() {
    let vault = &vault_with(&["c"]);
    let (locked_tx, locked_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    thread::scope(|s| {
        s.spawn(move || {
            vault
                .transaction(
                    TransactionDescriptor::new(|tx, _| {
                        tx.insert("c", json!({"_key": "held"}))?;
                        locked_tx.send(()).unwrap();
                        done_rx.recv().unwrap();
                        Ok(Value::Null)
                    })
                    .write("c"),
                )
                .unwrap();
        });

        locked_rx.recv().unwrap();
        let raw = json!({
            "collections": {"write": "c"},
            "action": "function () { return 1; }",
            "lockTimeout": 0,
        });
        let err = vault.context().run_json(&raw, &registry()).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(ref n) if n == "c"));
        assert_eq!(err.code(), 18);
        done_tx.send(()).unwrap();
    });

    assert_eq!(vault.count("c").unwrap(), 1);
}

#[test]
fn readers_run_concurrently() {
    let vault = &vault_with(&["c"]);
    let (locked_tx, locked_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    thread::scope(|s| {
        s.spawn(move || {
            vault
                .transaction(
                    TransactionDescriptor::new(|_, _| {
                        locked_tx.send(()).unwrap();
                        done_rx.recv().unwrap();
                        Ok(Value::Null)
                    })
                    .read("c"),
                )
                .unwrap();
        });
        locked_rx.recv().unwrap();
        let out = vault
            .transaction(
                TransactionDescriptor::new(|tx, _| Ok(json!(tx.count("c")?)))
                    .read("c")
                    .lock_timeout(0.0),
            )
            .unwrap();
        assert_eq!(out, json!(0));
        done_tx.send(()).unwrap();
    });
}

// ---------------------------------------------------------------------------
// Queries and fulltext
// ---------------------------------------------------------------------------

#[test]
fn query_remove_and_update_report_stats() {
    let vault = vault_with(&["c"]);
    for i in 0..10 {
        vault.insert("c", json!({"_key": format!("k{i}"), "n": i})).unwrap();
    }

    let updated = vault
        .query(
            &Query::for_in("c")
                .filter(json!({"n": {"$gte": 5}}))
                .update_in("c", json!({"big": true})),
        )
        .unwrap();
    assert_eq!(updated.stats.writes_executed, 5);
    assert_eq!(updated.stats.writes_ignored, 0);
    assert!(updated.documents.iter().all(|d| d["big"] == true));

    let removed = vault
        .query(
            &Query::for_in("c")
                .filter(json!({"big": true}))
                .sort("n", SortOrder::Desc)
                .limit(0, 2)
                .remove_in("c"),
        )
        .unwrap();
    assert_eq!(removed.stats.writes_executed, 2);
    let keys: Vec<&Value> = removed.documents.iter().map(|d| &d["_key"]).collect();
    assert_eq!(keys, [&json!("k9"), &json!("k8")]);
    assert_eq!(vault.count("c").unwrap(), 8);
}

#[test]
fn query_against_other_target_ignores_missing() {
    let vault = vault_with(&["src", "dst"]);
    for key in ["a", "b", "c"] {
        vault.insert("src", json!({"_key": key})).unwrap();
    }
    vault.insert("dst", json!({"_key": "b"})).unwrap();

    let q = Query::for_in("src").remove_in("dst");
    assert!(matches!(vault.query(&q), Err(Error::DocumentNotFound { .. })));
    assert_eq!(vault.count("dst").unwrap(), 1);

    let result = vault.query(&q.ignore_errors(true)).unwrap();
    assert_eq!(result.stats.writes_executed, 1);
    assert_eq!(result.stats.writes_ignored, 2);
    assert_eq!(vault.count("dst").unwrap(), 0);
}

#[test]
fn query_inside_transaction_rolls_back() {
    let vault = vault_with(&["c"]);
    vault.insert("c", json!({"_key": "a", "n": 1})).unwrap();
    let result = vault.transaction(
        TransactionDescriptor::new(|tx, _| {
            let q = Query::from_json(&json!({"for": "c", "remove": "c"}))?;
            assert_eq!(tx.query(&q)?.stats.writes_executed, 1);
            Err(Error::Rollback(Value::Null))
        })
        .write("c"),
    );
    assert!(result.is_err());
    assert_eq!(vault.count("c").unwrap(), 1);
}

#[test]
fn fulltext_search_with_prefixes() {
    let vault = vault_with(&["books"]);
    vault.ensure_index("books", &IndexDefinition::fulltext("text")).unwrap();
    vault.insert("books", json!({"_key": "1", "text": "The steam locomotive"})).unwrap();
    vault.insert("books", json!({"_key": "2", "text": "Local steam baths"})).unwrap();
    vault.insert("books", json!({"_key": "3", "text": "Electric trains"})).unwrap();

    let hits = vault.fulltext("books", "text", "steam,prefix:loc").unwrap();
    assert_eq!(hits.len(), 2);
    let hits = vault.fulltext("books", "text", "prefix:locom").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["_key"], "1");
    assert!(matches!(
        vault.fulltext("books", "title", "steam"),
        Err(Error::IndexNotFound(_))
    ));
}

#[test]
fn examples_match_nested_attributes() {
    let vault = vault_with(&["c"]);
    vault.insert("c", json!({"_key": "a", "addr": {"city": "Paris"}, "n": 1})).unwrap();
    vault.insert("c", json!({"_key": "b", "addr": {"city": "Rome"}, "n": 1})).unwrap();
    let hits = vault.by_example("c", &json!({"addr": {"city": "Rome"}})).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["_key"], "b");
    let first = vault.first_example("c", &json!({"n": 1})).unwrap().unwrap();
    assert_eq!(first["_key"], "a");
    assert!(vault.first_example("c", &json!({"n": 2})).unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Random workloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Insert(u8),
    Update(u8, i32),
    Replace(u8),
    Remove(u8),
    Truncate,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..8).prop_map(Op::Insert),
        2 => (0u8..8, any::<i32>()).prop_map(|(k, v)| Op::Update(k, v)),
        1 => (0u8..8).prop_map(Op::Replace),
        2 => (0u8..8).prop_map(Op::Remove),
        1 => Just(Op::Truncate),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn aborted_transactions_leave_no_trace(
        seed in prop::collection::vec(0u8..8, 0..6),
        ops in prop::collection::vec(op_strategy(), 1..20),
    ) {
        let vault = vault_with(&["c"]);
        vault.ensure_index("c", &IndexDefinition::cap(5)).unwrap();
        vault.ensure_index("c", &IndexDefinition::skiplist(&["v"])).unwrap();
        for k in seed {
            let _ = vault.insert("c", json!({"_key": format!("k{k}"), "v": k}));
        }
        let before = contents(&vault, "c");
        let revision = vault.revision("c").unwrap();

        let result = vault.transaction(
            TransactionDescriptor::new(|tx, _| {
                for op in &ops {
                    // individual failures (missing keys, duplicates) are fine
                    let _ = match op {
                        Op::Insert(k) => tx.insert("c", json!({"_key": format!("k{k}"), "v": k})).map(drop),
                        Op::Update(k, v) => tx.update("c", &format!("k{k}"), json!({"v": v})).map(drop),
                        Op::Replace(k) => tx.replace("c", &format!("k{k}"), json!({"r": true})).map(drop),
                        Op::Remove(k) => tx.remove("c", &format!("k{k}")).map(drop),
                        Op::Truncate => tx.truncate("c").map(drop),
                    };
                }
                Err(Error::Rollback(Value::Null))
            })
            .write("c"),
        );
        prop_assert!(result.is_err());
        prop_assert_eq!(contents(&vault, "c"), before);
        prop_assert_eq!(vault.revision("c").unwrap(), revision);
        let by_v = vault.query(&Query::for_in("c").filter(json!({"v": {"$gte": 0}}))).unwrap();
        prop_assert_eq!(by_v.documents.len(), vault.count("c").unwrap());
    }
}
