//! Integration tests for the catalog store over PostgreSQL.

mod common;

use common::run_catalog_test;
use curio_catalog::{
    BulkOutcome, CatalogError, CatalogStore, CellValue, InputRow, OnExisting, OnMissing,
    QueryOptions,
};
use curio_core::{DbType, PolicyName, PrincipalContext, TagDef, TagRef, TagValue};
use curio_query::{QueryShape, parse_path};
use std::sync::Arc;

fn alice() -> PrincipalContext {
    PrincipalContext::authenticated("alice", vec!["staff".to_string()])
}

fn bob() -> PrincipalContext {
    PrincipalContext::authenticated("bob", vec!["staff".to_string()])
}

fn row(pairs: &[(&str, &str)]) -> InputRow {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Some(v.to_string())))
        .collect()
}

async fn define_people_tags(store: &Arc<CatalogStore>, ctx: &PrincipalContext) {
    store
        .define_tag(
            ctx,
            &TagDef::new("name", DbType::Text)
                .unique()
                .with_policies(PolicyName::Anonymous, PolicyName::SubjectOwner),
        )
        .await
        .expect("define name");
    store
        .define_tag(ctx, &TagDef::new("email", DbType::Text))
        .await
        .expect("define email");
}

async fn merge_person(
    store: &Arc<CatalogStore>,
    ctx: &PrincipalContext,
    name: &str,
    email: &str,
) -> BulkOutcome {
    let path = parse_path("name(name;email)").expect("parse path");
    store
        .bulk_update(
            ctx,
            &path,
            &[row(&[("name", name), ("email", email)])],
            OnMissing::Create,
            OnExisting::Merge,
        )
        .await
        .expect("bulk update")
}

#[tokio::test]
async fn test_bootstrap_defines_reserved_tags() {
    run_catalog_test(|store| async move {
        let rows = store
            .query(
                &PrincipalContext::anonymous(),
                "tagdef(tagdef)",
                &QueryOptions::default(),
            )
            .await
            .expect("query tagdefs");
        let names: Vec<String> = rows
            .iter()
            .filter_map(|r| r.get("tagdef"))
            .filter_map(|c| c.as_value())
            .map(|v| v.render())
            .collect();
        for reserved in ["tagdef", "owner", "tags", "view"] {
            assert!(names.contains(&reserved.to_string()), "missing {reserved}");
        }
    })
    .await;
}

#[tokio::test]
async fn test_define_tag_and_set_get_triples() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;

        let subject = store.create_subject(&ctx).await.expect("create subject");
        store
            .set_triple(
                &ctx,
                subject,
                "email",
                Some(&TagValue::Text("a@x.com".into())),
            )
            .await
            .expect("set email");

        let values = store
            .get_triples(&ctx, subject, "email")
            .await
            .expect("get email");
        assert_eq!(values, vec![Some(TagValue::Text("a@x.com".into()))]);
    })
    .await;
}

#[tokio::test]
async fn test_unique_tag_rejects_second_binding() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;

        let first = store.create_subject(&ctx).await.expect("create first");
        let second = store.create_subject(&ctx).await.expect("create second");
        store
            .set_triple(&ctx, first, "name", Some(&TagValue::Text("alice".into())))
            .await
            .expect("set first name");

        let err = store
            .set_triple(&ctx, second, "name", Some(&TagValue::Text("alice".into())))
            .await
            .expect_err("duplicate unique value must fail");
        assert!(matches!(err, CatalogError::Conflict(_)), "got {err}");
    })
    .await;
}

#[tokio::test]
async fn test_reverse_index_tracks_presence() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;

        let subject = store.create_subject(&ctx).await.expect("create subject");
        store
            .set_triple(
                &ctx,
                subject,
                "email",
                Some(&TagValue::Text("a@x.com".into())),
            )
            .await
            .expect("set email");

        let tags = store
            .get_triples(&ctx, subject, "tags")
            .await
            .expect("read reverse index");
        let names: Vec<String> = tags
            .iter()
            .flatten()
            .map(|v| v.render())
            .collect();
        assert!(names.contains(&"email".to_string()));
        // Provenance tags are indexed too.
        assert!(names.contains(&"created".to_string()));

        store
            .delete_triple(&ctx, subject, "email", None)
            .await
            .expect("delete email");
        let tags = store
            .get_triples(&ctx, subject, "tags")
            .await
            .expect("read reverse index again");
        let names: Vec<String> = tags.iter().flatten().map(|v| v.render()).collect();
        assert!(!names.contains(&"email".to_string()));
    })
    .await;
}

#[tokio::test]
async fn test_bulk_create_then_merge_is_idempotent() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;

        let first = merge_person(&store, &ctx, "alice", "a@x.com").await;
        assert_eq!(first.created, 1);
        assert_eq!(first.updated, 0);

        // Identical input a second time changes nothing.
        let second = merge_person(&store, &ctx, "alice", "a@x.com").await;
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);

        // Exactly one subject is named alice.
        let rows = store
            .query(
                &ctx,
                "name=alice(name;email)",
                &QueryOptions::default(),
            )
            .await
            .expect("query alice");
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get("email"),
            Some(&CellValue::Value(TagValue::Text("a@x.com".into())))
        );
    })
    .await;
}

#[tokio::test]
async fn test_bulk_merge_updates_existing_subject() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;

        merge_person(&store, &ctx, "alice", "a@x.com").await;
        let outcome = merge_person(&store, &ctx, "alice", "new@x.com").await;
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.updated, 1);

        let rows = store
            .query(&ctx, "name=alice(email)", &QueryOptions::default())
            .await
            .expect("query alice");
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get("email"),
            Some(&CellValue::Value(TagValue::Text("new@x.com".into())))
        );
    })
    .await;
}

#[tokio::test]
async fn test_bulk_abort_modes() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;
        let path = parse_path("name(name;email)").expect("parse path");

        // Missing subject under abort.
        let err = store
            .bulk_update(
                &ctx,
                &path,
                &[row(&[("name", "ghost"), ("email", "g@x.com")])],
                OnMissing::Abort,
                OnExisting::Merge,
            )
            .await
            .expect_err("missing row must abort");
        assert!(matches!(err, CatalogError::NotFound(_)), "got {err}");

        // Replace is reserved.
        let err = store
            .bulk_update(
                &ctx,
                &path,
                &[row(&[("name", "alice"), ("email", "a@x.com")])],
                OnMissing::Create,
                OnExisting::Replace,
            )
            .await
            .expect_err("replace must be rejected");
        assert!(matches!(err, CatalogError::Malformed(_)), "got {err}");

        // A non-unique key is ambiguous identity.
        let err = store
            .bulk_update(
                &ctx,
                &parse_path("email(email)").expect("parse"),
                &[row(&[("email", "a@x.com")])],
                OnMissing::Create,
                OnExisting::Merge,
            )
            .await
            .expect_err("non-unique key must be rejected");
        assert!(matches!(err, CatalogError::Malformed(_)), "got {err}");
    })
    .await;
}

#[tokio::test]
async fn test_hard_reference_blocks_value_removal() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;
        store
            .define_tag(
                &ctx,
                &TagDef::new("manager", DbType::Text).with_tagref(TagRef::hard("name")),
            )
            .await
            .expect("define manager");

        merge_person(&store, &ctx, "alice", "a@x.com").await;
        let report = store.create_subject(&ctx).await.expect("create report");
        store
            .set_triple(
                &ctx,
                report,
                "manager",
                Some(&TagValue::Text("alice".into())),
            )
            .await
            .expect("set manager");

        // Deleting the referenced unique value must fail and change nothing.
        let rows = store
            .query(&ctx, "name=alice", &QueryOptions::default())
            .await
            .expect("find alice");
        let alice_id = rows[0].id().expect("id column");
        let err = store
            .delete_triple(&ctx, alice_id, "name", None)
            .await
            .expect_err("referenced value must not be deletable");
        assert!(matches!(err, CatalogError::Conflict(_)), "got {err}");

        let still = store
            .get_triples(&ctx, report, "manager")
            .await
            .expect("manager still present");
        assert_eq!(still, vec![Some(TagValue::Text("alice".into()))]);
    })
    .await;
}

#[tokio::test]
async fn test_bulk_subject_delete_cascades_references() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;
        store
            .define_tag(
                &ctx,
                &TagDef::new("manager", DbType::Text).with_tagref(TagRef::hard("name")),
            )
            .await
            .expect("define manager");

        merge_person(&store, &ctx, "alice", "a@x.com").await;
        let report = store.create_subject(&ctx).await.expect("create report");
        store
            .set_triple(
                &ctx,
                report,
                "manager",
                Some(&TagValue::Text("alice".into())),
            )
            .await
            .expect("set manager");

        let deleted = store
            .bulk_delete_subjects(&ctx, &parse_path("name=alice").expect("parse"))
            .await
            .expect("bulk delete");
        assert_eq!(deleted, 1);

        // No dangling manager triple survives the cascade.
        let remaining = store
            .get_triples(&ctx, report, "manager")
            .await
            .expect("manager read");
        assert!(remaining.is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_unreadable_tag_projects_as_null_not_error() {
    run_catalog_test(|store| async move {
        let owner = bob();
        define_people_tags(&store, &owner).await;
        // dept is readable only through its own ACL, which grants nobody.
        store
            .define_tag(
                &owner,
                &TagDef::new("dept", DbType::Text)
                    .with_policies(PolicyName::Tag, PolicyName::SubjectOwner),
            )
            .await
            .expect("define dept");

        let path = parse_path("name(name;dept)").expect("parse");
        store
            .bulk_update(
                &owner,
                &path,
                &[row(&[("name", "carol"), ("dept", "eng")])],
                OnMissing::Create,
                OnExisting::Merge,
            )
            .await
            .expect("seed carol");

        // A principal with no tag-reader grant sees the tag as absent and
        // cannot tell whether a value exists.
        let rows = store
            .query(&alice(), "name=carol(name;dept)", &QueryOptions::default())
            .await
            .expect("query as alice");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("dept"), None);

        // The tag's owner still reads it.
        let rows = store
            .query(&owner, "name=carol(dept)", &QueryOptions::default())
            .await
            .expect("query as bob");
        assert_eq!(
            rows[0].get("dept"),
            Some(&CellValue::Value(TagValue::Text("eng".into())))
        );
    })
    .await;
}

#[tokio::test]
async fn test_invisible_subject_reads_as_not_found() {
    run_catalog_test(|store| async move {
        let owner = bob();
        define_people_tags(&store, &owner).await;
        let subject = store.create_subject(&owner).await.expect("create subject");

        // Owned subject with no read grant for alice.
        let err = store
            .get_triples(&alice(), subject, "email")
            .await
            .expect_err("invisible subject must read as absent");
        assert!(matches!(err, CatalogError::NotFound(_)), "got {err}");

        // A truly absent subject is indistinguishable.
        let err = store
            .get_triples(&alice(), subject + 1000, "email")
            .await
            .expect_err("absent subject");
        assert!(matches!(err, CatalogError::NotFound(_)), "got {err}");
    })
    .await;
}

#[tokio::test]
async fn test_value_shapes() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;
        store
            .define_tag(&ctx, &TagDef::new("dept", DbType::Text))
            .await
            .expect("define dept");

        let path = parse_path("name(name;dept)").expect("parse");
        for (name, dept) in [("a", "eng"), ("b", "eng"), ("c", "ops")] {
            store
                .bulk_update(
                    &ctx,
                    &path,
                    &[row(&[("name", name), ("dept", dept)])],
                    OnMissing::Create,
                    OnExisting::Merge,
                )
                .await
                .expect("seed");
        }

        let rows = store
            .query(
                &ctx,
                "(dept)",
                &QueryOptions {
                    shape: QueryShape::Values,
                    ..Default::default()
                },
            )
            .await
            .expect("values");
        let values: Vec<String> = rows
            .iter()
            .filter_map(|r| r.get("dept"))
            .map(|c| c.render())
            .collect();
        assert_eq!(values, vec!["eng".to_string(), "ops".to_string()]);

        let rows = store
            .query(
                &ctx,
                "(dept)",
                &QueryOptions {
                    shape: QueryShape::Count,
                    ..Default::default()
                },
            )
            .await
            .expect("count");
        assert_eq!(
            rows[0].get("count"),
            Some(&CellValue::Value(TagValue::Int8(2)))
        );

        let rows = store
            .query(
                &ctx,
                "(dept)",
                &QueryOptions {
                    shape: QueryShape::TopVals {
                        limit: 1,
                        bottom: false,
                    },
                    ..Default::default()
                },
            )
            .await
            .expect("topvals");
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get("dept"),
            Some(&CellValue::Value(TagValue::Text("eng".into())))
        );
        assert_eq!(
            rows[0].get("count"),
            Some(&CellValue::Value(TagValue::Int8(2)))
        );
    })
    .await;
}

#[tokio::test]
async fn test_chained_path_through_reference() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;
        store
            .define_tag(&ctx, &TagDef::new("dept", DbType::Text))
            .await
            .expect("define dept");
        store
            .define_tag(
                &ctx,
                &TagDef::new("manager", DbType::Text).with_tagref(TagRef::hard("name")),
            )
            .await
            .expect("define manager");

        // boss runs eng; worker reports to boss.
        let seed = parse_path("name(name;email;dept)").expect("parse");
        store
            .bulk_update(
                &ctx,
                &seed,
                &[row(&[("name", "boss"), ("email", "boss@x.com"), ("dept", "eng")])],
                OnMissing::Create,
                OnExisting::Merge,
            )
            .await
            .expect("seed boss");
        let seed_worker = parse_path("name(name;manager)").expect("parse");
        store
            .bulk_update(
                &ctx,
                &seed_worker,
                &[row(&[("name", "worker"), ("manager", "boss")])],
                OnMissing::Create,
                OnExisting::Merge,
            )
            .await
            .expect("seed worker");

        // Managers of eng subjects, then their referents' email.
        let rows = store
            .query(
                &ctx,
                "name=worker(manager)/(email)",
                &QueryOptions::default(),
            )
            .await
            .expect("chained query");
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get("email"),
            Some(&CellValue::Value(TagValue::Text("boss@x.com".into())))
        );
    })
    .await;
}

#[tokio::test]
async fn test_views_expand_default_projection() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;
        merge_person(&store, &ctx, "alice", "a@x.com").await;

        store
            .define_view(&ctx, "contact", &["name".to_string(), "email".to_string()])
            .await
            .expect("define view");

        let rows = store
            .query(
                &ctx,
                "name=alice",
                &QueryOptions {
                    view: Some("contact".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("query with view");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].get("name").is_some());
        assert!(rows[0].get("email").is_some());

        let err = store
            .query(
                &ctx,
                "name=alice",
                &QueryOptions {
                    view: Some("nope".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect_err("unknown view");
        assert!(matches!(err, CatalogError::NotFound(_)), "got {err}");
    })
    .await;
}

#[tokio::test]
async fn test_undefine_tag_refused_while_referenced() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;
        store
            .define_tag(
                &ctx,
                &TagDef::new("manager", DbType::Text).with_tagref(TagRef::hard("name")),
            )
            .await
            .expect("define manager");

        let err = store
            .undefine_tag(&ctx, "name")
            .await
            .expect_err("undefine must refuse while referenced");
        assert!(matches!(err, CatalogError::Conflict(_)), "got {err}");

        store
            .undefine_tag(&ctx, "manager")
            .await
            .expect("undefine manager");
        store
            .undefine_tag(&ctx, "name")
            .await
            .expect("undefine name after referrer is gone");

        let err = store
            .query(&ctx, "name=alice", &QueryOptions::default())
            .await
            .expect_err("undefined tag in path");
        assert!(matches!(err, CatalogError::Malformed(_)), "got {err}");
    })
    .await;
}

#[tokio::test]
async fn test_bulk_delete_tags() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;
        merge_person(&store, &ctx, "alice", "a@x.com").await;
        merge_person(&store, &ctx, "bob", "b@x.com").await;

        let deleted = store
            .bulk_delete_tags(
                &ctx,
                &parse_path("name(name)").expect("parse"),
                &["email".to_string()],
            )
            .await
            .expect("bulk delete tags");
        assert_eq!(deleted, 2);

        let rows = store
            .query(&ctx, "email", &QueryOptions::default())
            .await
            .expect("query email presence");
        assert!(rows.is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_word_search_over_tsvector() {
    run_catalog_test(|store| async move {
        let ctx = alice();
        define_people_tags(&store, &ctx).await;
        store
            .define_tag(&ctx, &TagDef::new("notes", DbType::Tsvector))
            .await
            .expect("define notes");

        let path = parse_path("name(name;notes)").expect("parse");
        store
            .bulk_update(
                &ctx,
                &path,
                &[
                    row(&[("name", "a"), ("notes", "rust systems catalog")]),
                    row(&[("name", "b"), ("notes", "python scripting")]),
                ],
                OnMissing::Create,
                OnExisting::Merge,
            )
            .await
            .expect("seed notes");

        let rows = store
            .query(
                &ctx,
                "notes:word:rust(name)",
                &QueryOptions::default(),
            )
            .await
            .expect("word query");
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get("name"),
            Some(&CellValue::Value(TagValue::Text("a".into())))
        );

        let rows = store
            .query(
                &ctx,
                "notes:word:catalog;notes:!word:python(name)",
                &QueryOptions::default(),
            )
            .await
            .expect("negated word query");
        assert_eq!(rows.len(), 1);
    })
    .await;
}
