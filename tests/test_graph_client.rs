use std::fs;
use std::time::Duration;

use anyhow::Result;
use mail_agent::auth::StaticToken;
use mail_agent::enumerate::{MessagePager, PageCaps};
use mail_agent::error::RemoteErrorKind;
use mail_agent::graph::{GraphClient, MailStore};
use mail_agent::{mail, Error};
use mockito::{Matcher, Server};
use serde_json::json;

fn client(base_url: &str, max_retries: u32) -> Result<GraphClient> {
    Ok(GraphClient::new(
        base_url,
        Box::new(StaticToken::new("secret-token")),
        Duration::from_secs(5),
        max_retries,
    )?
    .with_backoff(Duration::ZERO, Duration::ZERO))
}

#[test]
fn sends_bearer_token_and_parses_folders() -> Result<()> {
    let mut server = Server::new();
    let mock = server
        .mock("GET", "/me/mailFolders/inbox")
        .match_header("authorization", "Bearer secret-token")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "id": "AAMk-inbox",
                "displayName": "Inbox",
                "childFolderCount": 2,
                "totalItemCount": 10,
                "unreadItemCount": 3
            })
            .to_string(),
        )
        .create();

    let folder = client(&server.url(), 0)?.get_folder("inbox")?;
    mock.assert();
    assert_eq!(folder.id, "AAMk-inbox");
    assert_eq!(folder.display_name, "Inbox");
    assert_eq!(folder.child_folder_count, 2);
    assert!(!folder.is_hidden);
    Ok(())
}

#[test]
fn throttling_is_retried_then_reported() -> Result<()> {
    let mut server = Server::new();
    let mock = server
        .mock("GET", "/me/messages/m1")
        .with_status(429)
        .with_header("retry-after", "0")
        .with_body(json!({"error": {"code": "TooManyRequests", "message": "slow down"}}).to_string())
        .expect(3)
        .create();

    let result = client(&server.url(), 2)?.get_message("m1");
    mock.assert();
    match result {
        Err(Error::Remote { status, kind, message }) => {
            assert_eq!(status, 429);
            assert_eq!(kind, RemoteErrorKind::Transient);
            assert_eq!(message, "TooManyRequests - slow down");
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
    Ok(())
}

#[test]
fn missing_items_are_permanent() -> Result<()> {
    let mut server = Server::new();
    let mock = server
        .mock("GET", "/me/messages/gone/attachments")
        .with_status(404)
        .with_body(json!({"error": {"code": "ErrorItemNotFound"}}).to_string())
        .expect(1)
        .create();

    let err = client(&server.url(), 2)?.list_attachments("gone").unwrap_err();
    mock.assert();
    assert!(err.is_not_found());
    assert_eq!(err.exit_code(), 4);
    Ok(())
}

#[test]
fn rejected_token_is_refreshed_once() -> Result<()> {
    let mut server = Server::new();
    let mock = server
        .mock("GET", "/me/messages/m1")
        .with_status(401)
        .expect(2)
        .create();

    let err = client(&server.url(), 2)?.get_message("m1").unwrap_err();
    mock.assert();
    assert!(matches!(err, Error::ReauthRequired(_)));
    assert_eq!(err.type_name(), "ReauthRequired");
    Ok(())
}

#[test]
fn message_pages_follow_next_link() -> Result<()> {
    let mut server = Server::new();
    let next = format!("{}/paged/2", server.url());
    let first = server
        .mock("GET", "/me/mailFolders/f1/messages")
        .match_query(Matcher::UrlEncoded(
            "$orderby".into(),
            "receivedDateTime DESC".into(),
        ))
        .with_status(200)
        .with_body(
            json!({
                "value": [
                    {"id": "m1", "subject": "one", "receivedDateTime": "2024-05-20T10:00:00Z", "hasAttachments": true},
                    {"id": "m2", "subject": "two", "receivedDateTime": "2024-05-19T10:00:00Z"}
                ],
                "@odata.nextLink": next
            })
            .to_string(),
        )
        .expect(2)
        .create();
    let second = server
        .mock("GET", "/paged/2")
        .with_status(200)
        .with_body(
            json!({
                "value": [
                    {"id": "m3", "receivedDateTime": "2024-05-18T10:00:00.1234567Z",
                     "from": {"emailAddress": {"address": "a@example.com"}}}
                ]
            })
            .to_string(),
        )
        .create();

    let client = client(&server.url(), 0)?;
    let mut pager = MessagePager::new(&client, "f1", None, PageCaps::new(5, 2)?);
    let first_two = pager.by_ref().collect::<mail_agent::Result<Vec<_>>>()?;
    assert_eq!(first_two.len(), 2);
    assert!(first_two[0].has_attachments);
    assert!(pager.outcome().cap_reached.is_some());

    let mut pager = MessagePager::new(&client, "f1", None, PageCaps::new(5, 3)?);
    let ids: Vec<String> = pager
        .by_ref()
        .map(|m| m.map(|m| m.id))
        .collect::<mail_agent::Result<Vec<_>>>()?;
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
    assert_eq!(pager.outcome().pages_fetched, 2);
    assert_eq!(pager.outcome().cap_reached, None);

    first.assert();
    second.assert();
    Ok(())
}

#[test]
fn malformed_messages_are_rejected() -> Result<()> {
    let mut server = Server::new();
    server
        .mock("GET", "/me/mailFolders/f1/messages")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({"value": [{"id": "m1", "receivedDateTime": "yesterday"}]}).to_string())
        .create();

    let client = client(&server.url(), 0)?;
    let result: mail_agent::Result<Vec<_>> =
        MessagePager::new(&client, "f1", None, PageCaps::new(1, 10)?).collect();
    assert!(matches!(result, Err(Error::Malformed { .. })));
    Ok(())
}

#[test]
fn single_attachment_download() -> Result<()> {
    let mut server = Server::new();
    server
        .mock("GET", "/me/messages/m1/attachments/a1")
        .with_status(200)
        .with_body(
            json!({
                "@odata.type": "#microsoft.graph.fileAttachment",
                "id": "a1",
                "name": "q1/report.pdf",
                "contentType": "application/pdf",
                "size": 5,
                "isInline": false
            })
            .to_string(),
        )
        .create();
    server
        .mock("GET", "/me/messages/m1/attachments/a1/$value")
        .with_status(200)
        .with_body("%PDF-")
        .create();

    let out = tempfile::tempdir()?;
    let result = mail::download_attachment(&client(&server.url(), 0)?, "m1", "a1", out.path())?;
    let saved = out.path().join("q1_report.pdf");
    assert_eq!(result["saved_path"], json!(saved));
    assert_eq!(result["size_bytes"], 5);
    assert_eq!(fs::read(&saved)?, b"%PDF-");
    Ok(())
}
