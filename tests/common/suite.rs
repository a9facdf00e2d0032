//! Behaviour every adapter must share. Each function takes a fresh engine.

use ousia_rest::{Engine, Error, QueryParams, RequestContext, UpsertItem};
use serde_json::{Value, json};

use super::*;

async fn list_ids(engine: &Engine, endpoint: &EndpointConfig, pairs: &[(&str, &str)]) -> Vec<String> {
    let page = engine
        .list(endpoint, &RequestContext::new(), &params(pairs))
        .await
        .unwrap_or_else(|err| panic!("list {:?} failed: {}", pairs, err));
    ids(&page.result)
}

async fn read(engine: &Engine, endpoint: &EndpointConfig, id: &str, pairs: &[(&str, &str)]) -> Result<Record, Error> {
    engine
        .read(endpoint, &RequestContext::new(), vec![json!(id)], &params(pairs))
        .await
        .map(|r| r.result)
}

pub async fn filters(engine: Engine) {
    seed(&engine).await;
    let users = users_endpoint();

    let cases: &[(&[(&str, &str)], &[&str])] = &[
        (&[("filter[age][gt]", "35")], &["u1", "u2"]),
        (&[("filter[age][ne]", "36")], &["u2", "u4"]),
        (&[("filter[age][nin]", "36,45")], &["u4"]),
        (&[("filter[age][between]", "30,40")], &["u1", "u4"]),
        (&[("filter[age][lte]", "30")], &["u4"]),
        (&[("filter[name][in]", "Ada,Linus")], &["u1", "u3"]),
        (&[("filter[email][like]", "%@example.com")], &["u1", "u4"]),
        (&[("filter[email][like]", "%_%")], &[]),
        (&[("filter[name][ilike]", "%A%")], &["u1", "u2", "u4"]),
        (&[("filter[email][null]", "true")], &["u3"]),
        (&[("filter[email][null]", "false")], &["u1", "u2", "u4"]),
        (&[("filter[active]", "false")], &["u2"]),
        (
            &[("filter[age][gte]", "30"), ("filter[email][like]", "%.com")],
            &["u1", "u4"],
        ),
    ];
    for (pairs, expected) in cases {
        assert_eq!(&list_ids(&engine, &users, pairs).await, expected, "{:?}", pairs);
    }

    for pairs in [
        [("filter[deletedAt][null]", "true")],
        [("filter[age][approx]", "3")],
        [("filter[age][between]", "1")],
        [("filter[active][ne]", "true")],
    ] {
        let result = engine
            .list(&users, &RequestContext::new(), &params(&pairs))
            .await;
        assert!(
            matches!(result, Err(Error::Validation(_))),
            "{:?} should be rejected",
            pairs
        );
    }

    // ilike folds ASCII letters only, identically on every backend.
    let ctx = RequestContext::new();
    for user in [
        json!({"id": "e1", "name": "ÉCOLE"}),
        json!({"id": "e2", "name": "école"}),
    ] {
        engine.create(&users, &ctx, obj(user)).await.unwrap();
    }
    let cases: &[(&str, &[&str])] = &[
        ("école", &["e2"]),
        ("%COLE", &["e1", "e2"]),
        ("É%", &["e1"]),
    ];
    for (pattern, expected) in cases {
        assert_eq!(
            &list_ids(&engine, &users, &[("filter[name][ilike]", *pattern)]).await,
            expected,
            "ilike {}",
            pattern
        );
    }
}

pub async fn pagination_and_ordering(engine: Engine) {
    seed(&engine).await;
    let users = users_endpoint();
    let ctx = RequestContext::new();

    let page = engine
        .list(&users, &ctx, &params(&[("perPage", "3"), ("page", "2")]))
        .await
        .unwrap();
    assert_eq!(ids(&page.result), vec!["u4"]);
    assert_eq!(page.result_info.total_count, 4);
    assert_eq!(page.result_info.total_pages, 2);
    assert!(page.result_info.has_prev_page);
    assert!(!page.result_info.has_next_page);

    let page = engine
        .list(&users, &ctx, &params(&[("perPage", "1000")]))
        .await
        .unwrap();
    assert_eq!(page.result_info.per_page, 50);

    assert_eq!(
        list_ids(&engine, &users, &[("orderBy", "age")]).await,
        vec!["u3", "u4", "u1", "u2"]
    );
    assert_eq!(
        list_ids(&engine, &users, &[("orderBy", "age"), ("orderDirection", "desc")]).await,
        vec!["u2", "u1", "u4", "u3"]
    );
    assert_eq!(
        list_ids(&engine, &users, &[("orderBy", "name")]).await,
        vec!["u1", "u4", "u2", "u3"]
    );

    // Strings order bytewise, so lower case sorts after upper case.
    engine
        .create(&users, &ctx, obj(json!({"id": "u5", "name": "adam"})))
        .await
        .unwrap();
    assert_eq!(
        list_ids(&engine, &users, &[("orderBy", "name")]).await,
        vec!["u1", "u4", "u2", "u3", "u5"]
    );
    assert_eq!(
        list_ids(&engine, &users, &[("orderBy", "name"), ("orderDirection", "desc")]).await,
        vec!["u5", "u3", "u2", "u4", "u1"]
    );
    assert_eq!(
        list_ids(&engine, &users, &[("filter[name][gt]", "Linus")]).await,
        vec!["u5"]
    );
}

pub async fn includes(engine: Engine) {
    seed(&engine).await;
    let users = users_endpoint();

    let page = engine
        .list(
            &users,
            &RequestContext::new(),
            &params(&[("include", "posts,profile")]),
        )
        .await
        .unwrap();
    let by_id = |id: &str| page.result.iter().find(|r| r["id"] == json!(id)).unwrap();

    let u1_posts: Vec<&str> = by_id("u1")["posts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    assert_eq!(u1_posts, vec!["p1", "p2"]);
    assert_eq!(by_id("u3")["posts"], json!([]));
    assert_eq!(by_id("u1")["profile"]["bio"], json!("math"));
    assert_eq!(by_id("u2")["profile"], Value::Null);
    assert_eq!(by_id("u1")["label"], json!("Ada <ada@example.com>"));

    let posts = posts_endpoint();
    let orphan = read(&engine, &posts, "p4", &[("include", "author")]).await.unwrap();
    assert_eq!(orphan["author"], Value::Null);
    let p3 = read(&engine, &posts, "p3", &[("include", "author")]).await.unwrap();
    assert_eq!(p3["author"]["name"], json!("Grace"));
    assert_eq!(p3["author"]["label"], json!("Grace <grace@navy.mil>"));

    let result = read(&engine, &posts, "p3", &[("include", "comments")]).await;
    assert!(matches!(result, Err(Error::Validation(_))));
    let result = read(&engine, &posts_endpoint().includes(&[]), "p3", &[("include", "author")]).await;
    assert!(matches!(result, Err(Error::Validation(_))));
}

pub async fn soft_delete(engine: Engine) {
    seed(&engine).await;
    let users = users_endpoint();
    let ctx = RequestContext::new();

    let deleted = engine.delete(&users, &ctx, vec![json!("u4")]).await.unwrap();
    assert!(deleted.success);
    assert!(deleted.result["deletedAt"].is_string());

    assert_eq!(list_ids(&engine, &users, &[]).await, vec!["u1", "u2", "u3"]);
    assert_eq!(read(&engine, &users, "u4", &[]).await, Err(Error::NotFound));
    assert_eq!(
        list_ids(&engine, &users, &[("withDeleted", "true")]).await,
        vec!["u1", "u2", "u3", "u4"]
    );
    assert_eq!(
        list_ids(&engine, &users, &[("onlyDeleted", "true")]).await,
        vec!["u4"]
    );
    assert!(read(&engine, &users, "u4", &[("withDeleted", "true")]).await.is_ok());

    let result = engine
        .update(&users, &ctx, vec![json!("u4")], obj(json!({"name": "B"})))
        .await;
    assert_eq!(result.unwrap_err(), Error::NotFound);
    let result = engine.delete(&users, &ctx, vec![json!("u4")]).await;
    assert_eq!(result.unwrap_err(), Error::NotFound);

    let restored = engine.restore(&users, &ctx, vec![json!("u4")]).await.unwrap();
    assert_eq!(restored.result["deletedAt"], Value::Null);
    assert_eq!(list_ids(&engine, &users, &[]).await.len(), 4);
    let again = engine.restore(&users, &ctx, vec![json!("u4")]).await.unwrap();
    assert_eq!(again.result["name"], json!("Barbara"));

    let settings = settings_endpoint();
    let result = engine
        .restore(&settings, &ctx, vec![json!("u1"), json!("theme")])
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));

    let created = engine
        .create(
            &users,
            &ctx,
            obj(json!({"id": "u9", "name": "Zombie", "deletedAt": "2020-01-01T00:00:00.000Z"})),
        )
        .await
        .unwrap();
    assert_eq!(created.result.get("deletedAt").cloned().unwrap_or(Value::Null), Value::Null);
    assert!(read(&engine, &users, "u9", &[]).await.is_ok());

    let posts = posts_endpoint();
    engine.delete(&posts, &ctx, vec![json!("p3")]).await.unwrap();
    let u2 = read(&engine, &users, "u2", &[("include", "posts")]).await.unwrap();
    assert_eq!(u2["posts"], json!([]));
    let u2 = read(&engine, &users, "u2", &[("include", "posts"), ("withDeleted", "true")])
        .await
        .unwrap();
    assert_eq!(u2["posts"][0]["id"], json!("p3"));
}

pub async fn tenancy(engine: Engine) {
    let projects = projects_endpoint();
    let (t1, t2) = (tenant("t1"), tenant("t2"));

    let pa = engine
        .create(
            &projects,
            &t1,
            obj(json!({"id": "pa", "orgId": "t2", "name": "Apollo", "tasks": [{"id": "ta1", "title": "Launch"}]})),
        )
        .await
        .unwrap();
    assert_eq!(pa.result["orgId"], json!("t1"));
    engine
        .create(&projects, &t2, obj(json!({"id": "pb", "name": "Borealis"})))
        .await
        .unwrap();

    let page = engine
        .list(&projects, &t1, &params(&[("include", "tasks")]))
        .await
        .unwrap();
    assert_eq!(ids(&page.result), vec!["pa"]);
    assert_eq!(page.result_info.total_count, 1);
    assert_eq!(page.result[0]["tasks"][0]["id"], json!("ta1"));
    assert_eq!(page.result[0]["tasks"][0]["orgId"], json!("t1"));

    let no_params = QueryParams::new();
    let result = engine.read(&projects, &t1, vec![json!("pb")], &no_params).await;
    assert_eq!(result.unwrap_err(), Error::NotFound);
    let result = engine
        .update(&projects, &t1, vec![json!("pb")], obj(json!({"name": "Stolen"})))
        .await;
    assert_eq!(result.unwrap_err(), Error::NotFound);
    let result = engine.delete(&projects, &t1, vec![json!("pb")]).await;
    assert_eq!(result.unwrap_err(), Error::NotFound);

    let updated = engine
        .update(&projects, &t1, vec![json!("pa")], obj(json!({"orgId": "t2", "name": "Apollo 11"})))
        .await
        .unwrap();
    assert_eq!(updated.result["orgId"], json!("t1"));

    let result = engine
        .update(
            &projects,
            &t2,
            vec![json!("pb")],
            obj(json!({"tasks": {"connect": ["ta1"]}})),
        )
        .await;
    assert_eq!(result.unwrap_err(), Error::NotFound);

    let result = engine
        .list(&projects, &RequestContext::new(), &QueryParams::new())
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));
}

pub async fn nested_writes(engine: Engine) {
    seed(&engine).await;
    let users = users_endpoint();
    let ctx = RequestContext::new();
    let with_children = [("include", "posts,profile")];

    let created = engine
        .create(
            &users,
            &ctx,
            obj(json!({
                "id": "u5",
                "name": "Edsger",
                "posts": [{"id": "p5", "title": "A"}, {"id": "p6", "title": "B"}],
                "profile": {"id": "pr5", "bio": "goto"}
            })),
        )
        .await
        .unwrap();
    assert_eq!(created.result["label"], json!("Edsger"));
    let u5 = read(&engine, &users, "u5", &with_children).await.unwrap();
    assert_eq!(ids(&records(&u5["posts"])), vec!["p5", "p6"]);
    assert_eq!(u5["profile"]["id"], json!("pr5"));

    engine
        .update(
            &users,
            &ctx,
            vec![json!("u5")],
            obj(json!({
                "posts": {
                    "create": [{"id": "p7", "title": "C"}],
                    "update": [{"id": "p5", "title": "A2"}],
                    "delete": ["p6"],
                    "connect": ["p4"]
                }
            })),
        )
        .await
        .unwrap();
    let u5 = read(&engine, &users, "u5", &with_children).await.unwrap();
    let posts = records(&u5["posts"]);
    assert_eq!(ids(&posts), vec!["p4", "p5", "p7"]);
    assert_eq!(posts[1]["title"], json!("A2"));
    let p6 = read(&engine, &posts_endpoint(), "p6", &[("withDeleted", "true")])
        .await
        .unwrap();
    assert!(p6["deletedAt"].is_string());

    engine
        .update(
            &users,
            &ctx,
            vec![json!("u5")],
            obj(json!({"posts": {"disconnect": [{"id": "p4"}]}})),
        )
        .await
        .unwrap();
    let p4 = read(&engine, &posts_endpoint(), "p4", &[]).await.unwrap();
    assert_eq!(p4["userId"], Value::Null);

    // a child owned by someone else aborts the whole request
    let result = engine
        .update(
            &users,
            &ctx,
            vec![json!("u5")],
            obj(json!({"name": "Hijacker", "posts": {"update": [{"id": "p1", "title": "mine"}]}})),
        )
        .await;
    assert_eq!(result.unwrap_err(), Error::NotFound);
    assert_eq!(read(&engine, &users, "u5", &[]).await.unwrap()["name"], json!("Edsger"));
    assert_eq!(read(&engine, &posts_endpoint(), "p1", &[]).await.unwrap()["title"], json!("Hello"));

    let result = engine
        .create(
            &users,
            &ctx,
            obj(json!({"id": "u6", "name": "Dup", "posts": [{"id": "p1", "title": "again"}]})),
        )
        .await;
    assert!(matches!(result, Err(Error::Conflict(_))));
    assert_eq!(read(&engine, &users, "u6", &[]).await, Err(Error::NotFound));

    let result = engine
        .update(
            &users,
            &ctx,
            vec![json!("u1")],
            obj(json!({"name": "Countess", "settings": {"delete": [["u1", "theme"]]}})),
        )
        .await;
    assert_eq!(
        result.unwrap_err(),
        Error::OperationNotAllowed {
            relation: "settings".to_string(),
            operation: "delete"
        }
    );
    assert_eq!(read(&engine, &users, "u1", &[]).await.unwrap()["name"], json!("Ada"));

    let narrow = users_endpoint().nested("posts", NestedWrites::only(&[NestedOperation::Create]));
    let result = engine
        .update(&narrow, &ctx, vec![json!("u1")], obj(json!({"posts": {"delete": ["p1"]}})))
        .await;
    assert!(matches!(result, Err(Error::OperationNotAllowed { .. })));

    let result = engine
        .update(&users, &ctx, vec![json!("u1")], obj(json!({"profile": {"disconnect": ["pr1"]}})))
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));

    let result = engine
        .create(
            &posts_endpoint(),
            &ctx,
            obj(json!({"id": "p9", "title": "x", "author": {"id": "u9", "name": "y"}})),
        )
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));

    let result = engine
        .create(&users, &ctx, obj(json!({"id": "u7", "name": "N", "posts": {"delete": ["p1"]}})))
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));

    engine
        .update(
            &users,
            &ctx,
            vec![json!("u1")],
            obj(json!({"settings": [{"key": "theme", "value": "dark"}]})),
        )
        .await
        .unwrap();
    let u1 = read(&engine, &users, "u1", &[("include", "settings")]).await.unwrap();
    assert_eq!(u1["settings"][0]["userId"], json!("u1"));
    assert_eq!(u1["settings"][0]["value"], json!("dark"));

    // integer child keys given as strings are coerced for every operation
    engine
        .update(
            &users,
            &ctx,
            vec![json!("u2")],
            obj(json!({"notes": [{"id": 5, "body": "draft"}, {"id": 6, "body": "spare"}]})),
        )
        .await
        .unwrap();
    engine
        .update(
            &users,
            &ctx,
            vec![json!("u2")],
            obj(json!({"notes": {"update": [{"id": "5", "body": "final"}], "delete": ["6"]}})),
        )
        .await
        .unwrap();
    let u2 = read(&engine, &users, "u2", &[("include", "notes")]).await.unwrap();
    assert_eq!(u2["notes"], json!([{"id": 5, "userId": "u2", "body": "final"}]));
}

fn records(value: &Value) -> Vec<Record> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_object().cloned()).collect())
        .unwrap_or_default()
}

pub async fn batch_upsert(engine: Engine) {
    seed(&engine).await;
    let settings = settings_endpoint();
    let ctx = RequestContext::new();

    let first = engine
        .batch_upsert(
            &settings,
            &ctx,
            vec![obj(json!({"userId": "u1", "key": "theme", "value": "dark"}))],
        )
        .await
        .unwrap();
    assert_eq!(first.created_count, 1);
    let created_at = match &first.items[0] {
        UpsertItem::Applied { record, .. } => record["createdAt"].clone(),
        other => panic!("unexpected {:?}", other),
    };
    assert!(created_at.is_string());

    let second = engine
        .batch_upsert(
            &settings,
            &ctx,
            vec![
                obj(json!({"userId": "u1", "key": "theme", "value": "light", "createdAt": "1999-01-01T00:00:00.000Z"})),
                obj(json!({"userId": "u1", "key": "lang", "value": "en"})),
            ],
        )
        .await
        .unwrap();
    assert!(second.success);
    assert_eq!((second.created_count, second.updated_count, second.total_count), (1, 1, 2));
    match &second.items[0] {
        UpsertItem::Applied {
            index,
            created,
            record,
        } => {
            assert_eq!((*index, *created), (0, false));
            assert_eq!(record["value"], json!("light"));
            assert_eq!(record["createdAt"], created_at);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        second.items[1],
        UpsertItem::Applied { index: 1, created: true, .. }
    ));

    let oversized: Vec<Record> = (0..4)
        .map(|i| obj(json!({"userId": "u2", "key": format!("k{}", i)})))
        .collect();
    let result = engine.batch_upsert(&settings, &ctx, oversized).await;
    assert!(matches!(result, Err(Error::Validation(_))));

    let missing_key = engine
        .batch_upsert(&settings, &ctx, vec![obj(json!({"userId": "u2", "value": 1}))])
        .await;
    assert!(matches!(missing_key, Err(Error::Validation(_))));

    // all-or-nothing by default
    let users = users_endpoint();
    let result = engine
        .batch_upsert(
            &users,
            &ctx,
            vec![
                obj(json!({"id": "u7", "name": "Kept?"})),
                obj(json!({"id": "u8", "name": "Bad", "shoeSize": 44})),
            ],
        )
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));
    assert_eq!(read(&engine, &users, "u7", &[]).await, Err(Error::NotFound));

    let lenient = users_endpoint().upsert(UpsertConfig::default().continue_on_error(true));
    let result = engine
        .batch_upsert(
            &lenient,
            &ctx,
            vec![
                obj(json!({"id": "u1", "name": "Ada L."})),
                obj(json!({"id": "u8", "name": "Bad", "shoeSize": 44})),
                obj(json!({"id": "u7", "name": "Kept"})),
            ],
        )
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(
        (result.created_count, result.updated_count, result.failed_count),
        (1, 1, 1)
    );
    let indexes: Vec<usize> = result.items.iter().map(UpsertItem::index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    match &result.items[1] {
        UpsertItem::Failed { error, .. } => assert_eq!(error.code, "VALIDATION_ERROR"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(read(&engine, &users, "u7", &[]).await.is_ok());
    assert_eq!(read(&engine, &users, "u1", &[]).await.unwrap()["name"], json!("Ada L."));
}

pub async fn transactions(engine: Engine) {
    let users = users_endpoint();
    let ctx = RequestContext::new();
    let (users_ref, ctx_ref) = (&users, &ctx);

    let result: Result<(), Error> = engine
        .run_in_transaction(|tx| async move {
            tx.create(users_ref, ctx_ref, obj(json!({"id": "t1", "name": "Temp"})))
                .await?;
            Err(Error::Conflict("abort".to_string()))
        })
        .await;
    assert!(result.is_err());
    assert_eq!(read(&engine, &users, "t1", &[]).await, Err(Error::NotFound));

    let count = engine
        .run_in_transaction(|tx| async move {
            tx.create(users_ref, ctx_ref, obj(json!({"id": "t2", "name": "Kept"})))
                .await?;
            tx.create(users_ref, ctx_ref, obj(json!({"id": "t3", "name": "Kept too"})))
                .await?;
            let page = tx.list(users_ref, ctx_ref, &QueryParams::new()).await?;
            Ok(page.result_info.total_count)
        })
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(list_ids(&engine, &users, &[]).await, vec!["t2", "t3"]);
}
