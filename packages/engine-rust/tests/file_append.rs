//! File producer options driven through a route.

use std::time::Duration;

use conduit_core::{expression, headers};
use conduit_engine::{EngineConfig, RouteDefinition, RoutingContext};

#[tokio::test]
async fn append_chars_after_a_single_message() {
    let dir = tempfile::tempdir().unwrap();
    let file_name = format!("hello{}.txt", uuid::Uuid::new_v4());

    let context = RoutingContext::new(EngineConfig::default());
    context
        .add_route(
            RouteDefinition::from("direct:start")
                .set_header(headers::FILE_NAME, expression::constant(file_name.as_str()))
                .to(format!("file:{}?fileExist=Append&appendChars=@@@", dir.path().display()))
                .to("mock:result"),
        )
        .await
        .unwrap();
    context.start().await.unwrap();

    let mock = context.mock_endpoint("mock:result").unwrap();
    mock.expected_message_count(1);

    context.template().send_body("direct:start", "Hello").await.unwrap();

    mock.assert_satisfied(Duration::from_secs(2)).await.unwrap();
    let written = std::fs::read_to_string(dir.path().join(&file_name)).unwrap();
    assert_eq!(written, "Hello@@@");
    context.shutdown().await.unwrap();
}

#[tokio::test]
async fn appending_twice_keeps_both_messages() {
    let dir = tempfile::tempdir().unwrap();

    let context = RoutingContext::new(EngineConfig::default());
    context
        .add_route(RouteDefinition::from("direct:log").to(format!(
            "file:{}?fileExist=Append&appendChars=;&fileName=log.txt",
            dir.path().display()
        )))
        .await
        .unwrap();
    context.start().await.unwrap();

    let template = context.template();
    template.send_body("direct:log", "first").await.unwrap();
    template.send_body("direct:log", "second").await.unwrap();

    let written = std::fs::read_to_string(dir.path().join("log.txt")).unwrap();
    assert_eq!(written, "first;second;");
    context.shutdown().await.unwrap();
}
