mod support;

use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use meridian_client::{SessionInfo, NOT_FOUND_CHANGE_TOKEN};
use support::ValueCommand;

#[tokio::test]
async fn a_304_serves_the_cached_payload_back_to_the_command() {
    let node = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/value"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(support::value_body("v1"))
                .insert_header("ETag", "abc"),
        )
        .up_to_n_times(1)
        .mount(&node)
        .await;
    Mock::given(method("GET"))
        .and(path("/value"))
        .and(header("If-None-Match", "abc"))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&node)
        .await;

    let executor = support::pinned_executor(&[node.uri()]);

    let mut first = ValueCommand::cacheable();
    executor.execute(&mut first, None).await.unwrap();
    assert_eq!(first.parsed_from_cache, Some(false));
    assert_eq!(first.result.unwrap().value, "v1");

    let mut second = ValueCommand::cacheable();
    executor.execute(&mut second, None).await.unwrap();
    assert_eq!(second.parsed_from_cache, Some(true));
    assert_eq!(second.result.unwrap().value, "v1");
}

#[tokio::test]
async fn aggressive_caching_skips_the_network_inside_the_window() {
    let node = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/value"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(support::value_body("v1"))
                .insert_header("ETag", "abc"),
        )
        .expect(1)
        .mount(&node)
        .await;

    let executor = support::pinned_executor(&[node.uri()]);

    let mut first = ValueCommand::aggressively_cacheable();
    executor.execute(&mut first, None).await.unwrap();
    assert_eq!(first.parsed_from_cache, Some(false));

    let mut second = ValueCommand::aggressively_cacheable();
    executor.execute(&mut second, None).await.unwrap();
    assert_eq!(second.parsed_from_cache, Some(true));
    assert_eq!(second.result.unwrap().value, "v1");
}

#[tokio::test]
async fn invalidation_forces_aggressive_reads_back_to_the_server() {
    let node = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/value"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(support::value_body("v1"))
                .insert_header("ETag", "abc"),
        )
        .expect(2)
        .mount(&node)
        .await;

    let executor = support::pinned_executor(&[node.uri()]);

    let mut first = ValueCommand::aggressively_cacheable();
    executor.execute(&mut first, None).await.unwrap();

    executor.invalidate_cached_responses();

    // might-be-stale entries are not served aggressively; this one goes back
    // to the server (which confirms it, as it still matches)
    let mut second = ValueCommand::aggressively_cacheable();
    executor.execute(&mut second, None).await.unwrap();
}

#[tokio::test]
async fn a_404_read_is_an_empty_result_and_is_revalidated_conditionally() {
    let node = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/value"))
        .and(header("If-None-Match", NOT_FOUND_CHANGE_TOKEN))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&node)
        .await;
    Mock::given(method("GET"))
        .and(path("/value"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&node)
        .await;

    let executor = support::pinned_executor(&[node.uri()]);

    let mut first = ValueCommand::cacheable();
    executor.execute(&mut first, None).await.unwrap();
    assert!(first.result.is_none());

    let mut second = ValueCommand::cacheable();
    executor.execute(&mut second, None).await.unwrap();
    assert!(second.result.is_none());
}

#[tokio::test]
async fn sessions_can_opt_out_of_caching() {
    let node = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/value"))
        .and(header_exists("If-None-Match"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&node)
        .await;
    Mock::given(method("GET"))
        .and(path("/value"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(support::value_body("v1"))
                .insert_header("ETag", "abc"),
        )
        .expect(2)
        .mount(&node)
        .await;

    let executor = support::pinned_executor(&[node.uri()]);
    let session = SessionInfo {
        no_caching: true,
        ..SessionInfo::new(7)
    };

    let mut first = ValueCommand::cacheable();
    executor.execute(&mut first, Some(&session)).await.unwrap();
    let mut second = ValueCommand::cacheable();
    executor.execute(&mut second, Some(&session)).await.unwrap();
    assert_eq!(second.parsed_from_cache, Some(false));
}
