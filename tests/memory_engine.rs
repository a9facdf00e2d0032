mod common;

use std::sync::Arc;

use common::*;
use ousia_rest::{Engine, RequestContext, adapters::memory::MemoryAdapter};

fn engine() -> (MemoryAdapter, Engine) {
    let adapter = MemoryAdapter::new();
    let engine = Engine::new(Arc::new(adapter.clone()), registry());
    (adapter, engine)
}

#[tokio::test]
async fn test_filters() {
    suite::filters(engine().1).await;
}

#[tokio::test]
async fn test_pagination_and_ordering() {
    suite::pagination_and_ordering(engine().1).await;
}

#[tokio::test]
async fn test_includes() {
    suite::includes(engine().1).await;
}

#[tokio::test]
async fn test_soft_delete() {
    suite::soft_delete(engine().1).await;
}

#[tokio::test]
async fn test_tenancy() {
    suite::tenancy(engine().1).await;
}

#[tokio::test]
async fn test_nested_writes() {
    suite::nested_writes(engine().1).await;
}

#[tokio::test]
async fn test_batch_upsert() {
    suite::batch_upsert(engine().1).await;
}

#[tokio::test]
async fn test_transactions() {
    suite::transactions(engine().1).await;
}

#[tokio::test]
async fn test_one_fetch_per_included_relation() {
    let (adapter, engine) = engine();
    seed(&engine).await;
    for i in 0..30 {
        engine
            .create(
                &posts_endpoint(),
                &RequestContext::new(),
                obj(serde_json::json!({"id": format!("bulk{:02}", i), "userId": "u3", "title": "bulk"})),
            )
            .await
            .unwrap();
    }

    adapter.reset_calls();
    let page = engine
        .list(
            &users_endpoint(),
            &RequestContext::new(),
            &params(&[("include", "posts,profile,settings")]),
        )
        .await
        .unwrap();
    assert_eq!(page.result.len(), 4);
    assert_eq!(adapter.find_many_calls("users"), 1);
    assert_eq!(adapter.find_many_calls("posts"), 1);
    assert_eq!(adapter.find_many_calls("profiles"), 1);
    assert_eq!(adapter.find_many_calls("settings"), 1);

    let u3 = page.result.iter().find(|r| r["id"] == "u3").unwrap();
    assert_eq!(u3["posts"].as_array().map(Vec::len), Some(30));
}

#[tokio::test]
async fn test_relation_order_is_stable() {
    let (_, engine) = engine();
    seed(&engine).await;
    let include = params(&[("include", "posts")]);
    let first = engine
        .list(&users_endpoint(), &RequestContext::new(), &include)
        .await
        .unwrap();
    for _ in 0..5 {
        let again = engine
            .list(&users_endpoint(), &RequestContext::new(), &include)
            .await
            .unwrap();
        assert_eq!(again, first);
    }
}

#[tokio::test]
async fn test_zero_max_per_page_serves_single_rows() {
    let (_, engine) = engine();
    seed(&engine).await;
    let mut users = users_endpoint();
    users.max_per_page = 0;

    let page = engine
        .list(&users, &RequestContext::new(), &params(&[("page", "2")]))
        .await
        .unwrap();
    assert_eq!(page.result_info.per_page, 1);
    assert_eq!(page.result_info.total_pages, 4);
    assert_eq!(ids(&page.result), vec!["u2"]);
}
