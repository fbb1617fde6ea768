use webserv::http::request::Version;
use webserv::http::response::{Response, ResponseBuilder, StatusCode, default_error_page};
use webserv::http::writer::{Framing, ResponseWriter, WriteOptions};

async fn render(response: Response, options: WriteOptions) -> String {
    let mut out: Vec<u8> = Vec::new();
    let mut writer = ResponseWriter::new(response, options);
    writer.write_to_stream(&mut out).await.unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn test_status_code_values() {
    assert_eq!(StatusCode::Ok.as_u16(), 200);
    assert_eq!(StatusCode::Created.as_u16(), 201);
    assert_eq!(StatusCode::NoContent.as_u16(), 204);
    assert_eq!(StatusCode::BadRequest.as_u16(), 400);
    assert_eq!(StatusCode::NotFound.as_u16(), 404);
    assert_eq!(StatusCode::MethodNotAllowed.as_u16(), 405);
    assert_eq!(StatusCode::PayloadTooLarge.as_u16(), 413);
    assert_eq!(StatusCode::RequestHeaderFieldsTooLarge.as_u16(), 431);
    assert_eq!(StatusCode::InternalServerError.as_u16(), 500);
    assert_eq!(StatusCode::GatewayTimeout.as_u16(), 504);
    assert_eq!(StatusCode::Other(418).as_u16(), 418);
}

#[test]
fn test_status_code_reason_phrases() {
    assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    assert_eq!(StatusCode::Created.reason_phrase(), "Created");
    assert_eq!(StatusCode::NoContent.reason_phrase(), "No Content");
    assert_eq!(StatusCode::BadRequest.reason_phrase(), "Bad Request");
    assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    assert_eq!(StatusCode::MethodNotAllowed.reason_phrase(), "Method Not Allowed");
    assert_eq!(StatusCode::InternalServerError.reason_phrase(), "Internal Server Error");
    assert_eq!(StatusCode::Other(299).reason_phrase(), "Success");
    assert_eq!(StatusCode::Other(599).reason_phrase(), "Server Error");
}

#[test]
fn test_status_code_bodies() {
    assert!(StatusCode::Ok.allows_body());
    assert!(!StatusCode::NoContent.allows_body());
    assert!(!StatusCode::NotModified.allows_body());
    assert!(!StatusCode::Other(101).allows_body());
    assert!(StatusCode::NotFound.is_error());
    assert!(!StatusCode::Found.is_error());
}

#[test]
fn test_response_builder_basic() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Type", "text/plain")
        .body("Hello")
        .build();

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.headers.get("content-type"), Some("text/plain"));
    assert_eq!(response.body.as_bytes(), Some(&b"Hello"[..]));
    assert!(!response.close);
}

#[test]
fn test_response_builder_header_replaces() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("X-Custom", "one")
        .header("x-custom", "two")
        .build();

    assert_eq!(response.headers.count("X-Custom"), 1);
    assert_eq!(response.headers.get("X-Custom"), Some("two"));
}

#[test]
fn test_response_ok_helper() {
    let response = Response::ok("Success");
    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.body.len(), Some(7));
}

#[test]
fn test_response_error_helpers() {
    let response = Response::not_found();
    assert_eq!(response.status, StatusCode::NotFound);
    assert_eq!(response.headers.get("Content-Type"), Some("text/html"));
    let body = String::from_utf8(response.body.as_bytes().unwrap().to_vec()).unwrap();
    assert!(body.contains("404 Not Found"));

    let response = Response::internal_error();
    assert_eq!(response.status, StatusCode::InternalServerError);
}

#[test]
fn test_default_error_page_mentions_status() {
    let page = default_error_page(StatusCode::PayloadTooLarge);
    let page = String::from_utf8(page.to_vec()).unwrap();
    assert!(page.contains("<title>413 Payload Too Large</title>"));
}

#[test]
fn test_redirect_sets_location() {
    let response = Response::redirect(StatusCode::MovedPermanently, "/new?a=1&b=2");
    assert_eq!(response.status, StatusCode::MovedPermanently);
    assert_eq!(response.headers.get("Location"), Some("/new?a=1&b=2"));
    let body = String::from_utf8(response.body.as_bytes().unwrap().to_vec()).unwrap();
    assert!(body.contains("/new?a=1&amp;b=2"));
}

#[test]
fn test_method_not_allowed_lists_methods() {
    let response = Response::method_not_allowed("GET, HEAD, OPTIONS");
    assert_eq!(response.status, StatusCode::MethodNotAllowed);
    assert_eq!(response.headers.get("Allow"), Some("GET, HEAD, OPTIONS"));
}

#[tokio::test]
async fn test_writer_serializes_full_response() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Type", "text/plain")
        .body("Hello")
        .build();
    let text = render(response, WriteOptions::default()).await;

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("\r\nDate: "));
    assert!(text.contains("\r\nServer: webserv/"));
    assert!(text.contains("\r\nContent-Type: text/plain\r\n"));
    assert!(text.contains("\r\nContent-Length: 5\r\n"));
    assert!(text.contains("\r\nConnection: keep-alive\r\n"));
    assert!(text.ends_with("\r\n\r\nHello"));
}

#[tokio::test]
async fn test_writer_head_only_omits_body() {
    let options = WriteOptions {
        head_only: true,
        ..WriteOptions::default()
    };
    let text = render(Response::ok("Hello"), options).await;

    assert!(text.contains("Content-Length: 5\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
    assert!(!text.contains("Hello"));
}

#[tokio::test]
async fn test_writer_no_content_has_no_length() {
    let text = render(ResponseBuilder::new(StatusCode::NoContent).build(), WriteOptions::default()).await;
    assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
    assert!(!text.contains("Content-Length"));
}

#[test]
fn test_writer_connection_header_follows_options() {
    let options = WriteOptions {
        version: Version::Http10,
        keep_alive: false,
        head_only: false,
    };
    let writer = ResponseWriter::new(Response::ok("x"), options);
    assert!(!writer.keep_alive());
    assert_eq!(writer.framing(), Framing::ContentLength(1));
    let head = String::from_utf8(writer.head().to_vec()).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Connection: close\r\n"));
}
