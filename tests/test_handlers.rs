use std::fs;
use std::io::Read;
use std::sync::Arc;
use std::time::SystemTime;

use tempfile::TempDir;
use webserv::config::Config;
use webserv::handler::Dispatcher;
use webserv::http::connection::ConnInfo;
use webserv::http::request::{Method, Request, RequestBuilder};
use webserv::http::response::{Response, ResponseBody, StatusCode};
use webserv::router::Router;

struct Site {
    dir: TempDir,
    dispatcher: Dispatcher,
}

fn site() -> Site {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("www");
    fs::create_dir_all(root.join("docs")).unwrap();
    fs::create_dir_all(root.join("list/sub")).unwrap();
    fs::create_dir_all(root.join("bare")).unwrap();
    fs::create_dir_all(root.join("files")).unwrap();
    fs::create_dir_all(dir.path().join("errors")).unwrap();
    fs::write(root.join("hello.txt"), "Hello, world!\n").unwrap();
    fs::write(root.join("docs/index.html"), "<h1>docs</h1>").unwrap();
    fs::write(root.join("list/a b.txt"), "a").unwrap();
    fs::write(dir.path().join("secret.txt"), "top secret").unwrap();
    fs::write(dir.path().join("errors/404.html"), "<p>custom missing</p>").unwrap();

    let yaml = format!(
        r#"
servers:
  - listen: ["127.0.0.1:8080"]
    server_names: [localhost]
    root: {root}
    error_pages:
      404: {errors}/404.html
    locations:
      - path: /
        methods: [GET, PATCH]
      - path: /list
        root: {root}/list
        autoindex: true
      - path: /files
        root: {root}/files
        methods: [GET, PUT, DELETE]
      - path: /drop
        methods: [POST]
      - path: /uploads
        methods: [GET, POST]
        upload_dir: {uploads}
        client_max_body_size: 1M
      - path: /store
        methods: [GET, PUT, POST, DELETE]
        upload_dir: {store}
      - path: /old
        redirect:
          code: 302
          target: /hello.txt
"#,
        root = root.display(),
        errors = dir.path().join("errors").display(),
        uploads = dir.path().join("uploads").display(),
        store = dir.path().join("store").display(),
    );
    let config = Arc::new(Config::from_yaml_str(&yaml).unwrap());
    let dispatcher = Dispatcher::new(Router::new(config, vec![0]));
    Site { dir, dispatcher }
}

fn conn() -> ConnInfo {
    ConnInfo {
        peer: "127.0.0.1:50000".parse().unwrap(),
        local: "127.0.0.1:8080".parse().unwrap(),
    }
}

fn request(method: Method, target: &str) -> RequestBuilder {
    RequestBuilder::new()
        .method(method)
        .target(target)
        .header("Host", "localhost")
}

async fn send(site: &Site, request: Request) -> Response {
    site.dispatcher.dispatch(&request, &conn()).await
}

fn body_text(response: Response) -> String {
    match response.body {
        ResponseBody::Empty => String::new(),
        ResponseBody::Bytes(bytes) => String::from_utf8(bytes.to_vec()).unwrap(),
        ResponseBody::File { mut file, len } => {
            let mut text = String::new();
            (&mut file).take(len).read_to_string(&mut text).unwrap();
            text
        }
        ResponseBody::Stream(_) => panic!("unexpected streamed body"),
    }
}

#[tokio::test]
async fn test_get_static_file() {
    let site = site();
    let response = send(&site, request(Method::GET, "/hello.txt").build().unwrap()).await;

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(
        response.headers.get("Content-Type"),
        Some("text/plain; charset=utf-8")
    );
    assert!(response.headers.contains("Last-Modified"));
    assert_eq!(response.body.len(), Some(14));
    assert_eq!(body_text(response), "Hello, world!\n");
}

#[tokio::test]
async fn test_missing_file_uses_custom_error_page() {
    let site = site();
    let response = send(&site, request(Method::GET, "/nope.txt").build().unwrap()).await;

    assert_eq!(response.status, StatusCode::NotFound);
    assert_eq!(
        response.headers.get("Content-Type"),
        Some("text/html; charset=utf-8")
    );
    assert_eq!(body_text(response), "<p>custom missing</p>");
}

#[tokio::test]
async fn test_directory_without_slash_redirects() {
    let site = site();
    let response = send(&site, request(Method::GET, "/docs?x=1").build().unwrap()).await;

    assert_eq!(response.status, StatusCode::MovedPermanently);
    assert_eq!(response.headers.get("Location"), Some("/docs/?x=1"));
}

#[tokio::test]
async fn test_directory_serves_index() {
    let site = site();
    let response = send(&site, request(Method::GET, "/docs/").build().unwrap()).await;

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(body_text(response), "<h1>docs</h1>");
}

#[tokio::test]
async fn test_directory_listing() {
    let site = site();
    let response = send(&site, request(Method::GET, "/list/").build().unwrap()).await;

    assert_eq!(response.status, StatusCode::Ok);
    let page = body_text(response);
    assert!(page.contains("Index of /list/"));
    assert!(page.contains("href=\"sub/\""));
    assert!(page.contains("href=\"a%20b.txt\""));
    assert!(page.contains("href=\"../\""));
    // directories are listed before files
    assert!(page.find("sub/").unwrap() < page.find("a b.txt").unwrap());
}

#[tokio::test]
async fn test_directory_without_index_is_forbidden() {
    let site = site();
    let response = send(&site, request(Method::GET, "/bare/").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::Forbidden);
}

#[tokio::test]
async fn test_if_modified_since() {
    let site = site();
    let future = httpdate::fmt_http_date(SystemTime::now() + std::time::Duration::from_secs(3600));
    let response = send(
        &site,
        request(Method::GET, "/hello.txt")
            .header("If-Modified-Since", future)
            .build()
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::NotModified);
    assert!(response.headers.contains("Last-Modified"));

    let past = "Thu, 01 Jan 1970 00:00:00 GMT";
    let response = send(
        &site,
        request(Method::GET, "/hello.txt")
            .header("If-Modified-Since", past)
            .build()
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::Ok);
}

#[tokio::test]
async fn test_traversal_is_forbidden() {
    let site = site();
    let response = send(&site, request(Method::GET, "/%2e%2e/secret.txt").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::Forbidden);

    let response = send(&site, request(Method::GET, "/files/../../secret.txt").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::Forbidden);
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_out_of_root_is_forbidden() {
    let site = site();
    let link = site.dir.path().join("www/leak.txt");
    std::os::unix::fs::symlink(site.dir.path().join("secret.txt"), &link).unwrap();

    let response = send(&site, request(Method::GET, "/leak.txt").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::Forbidden);
}

#[tokio::test]
async fn test_method_not_allowed_lists_allow() {
    let site = site();
    let response = send(
        &site,
        request(Method::DELETE, "/hello.txt").build().unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::MethodNotAllowed);
    assert_eq!(response.headers.get("Allow"), Some("GET, PATCH, HEAD, OPTIONS"));
}

#[tokio::test]
async fn test_options_reports_allowed_methods() {
    let site = site();
    let response = send(&site, request(Method::OPTIONS, "/files/x").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::NoContent);
    assert_eq!(response.headers.get("Allow"), Some("GET, PUT, DELETE, HEAD, OPTIONS"));

    let response = send(&site, request(Method::OPTIONS, "*").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::NoContent);
    assert!(response.headers.get("Allow").unwrap().contains("DELETE"));
}

#[tokio::test]
async fn test_allowed_method_without_handler() {
    let site = site();
    let response = send(&site, request(Method::PATCH, "/hello.txt").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::NotImplemented);
}

#[tokio::test]
async fn test_redirect_location() {
    let site = site();
    let response = send(&site, request(Method::GET, "/old/anything").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::Found);
    assert_eq!(response.headers.get("Location"), Some("/hello.txt"));
}

#[tokio::test]
async fn test_put_get_delete_round_trip() {
    let site = site();
    let stored = site.dir.path().join("www/files/note.txt");

    let response = send(
        &site,
        request(Method::PUT, "/files/note.txt").body("first").build().unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::Created);
    assert_eq!(response.headers.get("Location"), Some("/files/note.txt"));
    assert_eq!(fs::read_to_string(&stored).unwrap(), "first");

    let response = send(
        &site,
        request(Method::PUT, "/files/note.txt").body("second").build().unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::Ok);

    let response = send(&site, request(Method::GET, "/files/note.txt").build().unwrap()).await;
    assert_eq!(body_text(response), "second");

    let response = send(&site, request(Method::DELETE, "/files/note.txt").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::Ok);
    assert!(!stored.exists());

    let response = send(&site, request(Method::DELETE, "/files/note.txt").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::NotFound);
}

#[tokio::test]
async fn test_put_get_delete_share_the_upload_dir() {
    let site = site();
    let stored = site.dir.path().join("store/n.txt");

    let response = send(
        &site,
        request(Method::PUT, "/store/n.txt").body("payload").build().unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::Created);
    assert_eq!(fs::read_to_string(&stored).unwrap(), "payload");
    assert!(!site.dir.path().join("www/store").exists());

    let response = send(&site, request(Method::GET, "/store/n.txt").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(body_text(response), "payload");

    let response = send(&site, request(Method::DELETE, "/store/n.txt").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::Ok);
    assert!(!stored.exists());

    let response = send(&site, request(Method::GET, "/store/n.txt").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::NotFound);
}

#[tokio::test]
async fn test_bare_disposition_filename_then_delete() {
    let site = site();
    let response = send(
        &site,
        request(Method::POST, "/store")
            .header("Content-Type", "text/plain")
            .header("Content-Disposition", "filename=delete_me_1.txt")
            .body("temporary")
            .build()
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::Created);
    assert_eq!(response.headers.get("Location"), Some("/store/delete_me_1.txt"));

    let response = send(
        &site,
        request(Method::DELETE, "/store/delete_me_1.txt").build().unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::Ok);
    assert!(!site.dir.path().join("store/delete_me_1.txt").exists());
}

#[tokio::test]
async fn test_generated_name_for_plain_text() {
    let site = site();
    let response = send(
        &site,
        request(Method::POST, "/store")
            .header("Content-Type", "text/plain")
            .body("no name given")
            .build()
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::Created);
    let location = response.headers.get("Location").unwrap();
    assert!(location.starts_with("/store/upload-"));
    assert!(location.ends_with(".txt"), "{location}");
}

#[cfg(unix)]
#[tokio::test]
async fn test_upload_through_symlink_is_forbidden() {
    let site = site();
    let secret = site.dir.path().join("secret.txt");
    std::os::unix::fs::symlink(&secret, site.dir.path().join("www/files/evil")).unwrap();

    let response = send(
        &site,
        request(Method::PUT, "/files/evil").body("overwritten").build().unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::Forbidden);

    fs::create_dir_all(site.dir.path().join("store")).unwrap();
    std::os::unix::fs::symlink(&secret, site.dir.path().join("store/link")).unwrap();
    let response = send(
        &site,
        request(Method::POST, "/store/link").body("overwritten").build().unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::Forbidden);

    assert_eq!(fs::read_to_string(&secret).unwrap(), "top secret");
}

#[tokio::test]
async fn test_put_to_directory_is_forbidden() {
    let site = site();
    let response = send(&site, request(Method::PUT, "/files/").body("x").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::Forbidden);
}

#[tokio::test]
async fn test_delete_directory_is_forbidden() {
    let site = site();
    fs::create_dir_all(site.dir.path().join("www/files/keep")).unwrap();
    let response = send(&site, request(Method::DELETE, "/files/keep").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::Forbidden);
    assert!(site.dir.path().join("www/files/keep").is_dir());
}

#[tokio::test]
async fn test_multipart_upload() {
    let site = site();
    let body = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"../report.txt\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
quarterly numbers\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"comment\"\r\n\
\r\n\
ignored\r\n\
--XyZ--\r\n"
        .to_vec();
    let response = send(
        &site,
        request(Method::POST, "/uploads")
            .header("Content-Type", "multipart/form-data; boundary=XyZ")
            .body(body)
            .build()
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::Created);
    assert_eq!(response.headers.get("Location"), Some("/uploads/report.txt"));
    assert_eq!(body_text(response), "Stored report.txt\n");
    let stored = site.dir.path().join("uploads/report.txt");
    assert_eq!(fs::read_to_string(stored).unwrap(), "quarterly numbers");
}

#[tokio::test]
async fn test_raw_post_upload_names() {
    let site = site();

    let response = send(
        &site,
        request(Method::POST, "/uploads/")
            .header("Content-Disposition", "attachment; filename=\"data.csv\"")
            .body("a,b\n")
            .build()
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::Created);
    assert_eq!(response.headers.get("Location"), Some("/uploads/data.csv"));

    let response = send(
        &site,
        request(Method::POST, "/uploads/named.bin").body("raw").build().unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::Created);
    assert_eq!(
        fs::read_to_string(site.dir.path().join("uploads/named.bin")).unwrap(),
        "raw"
    );

    let response = send(
        &site,
        request(Method::POST, "/uploads")
            .header("Content-Type", "image/png")
            .body(vec![0x89, b'P', b'N', b'G'])
            .build()
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::Created);
    let location = response.headers.get("Location").unwrap().to_string();
    assert!(location.starts_with("/uploads/upload-"));
    assert!(location.ends_with(".png"));
}

#[tokio::test]
async fn test_malformed_multipart_is_rejected() {
    let site = site();
    let response = send(
        &site,
        request(Method::POST, "/uploads")
            .header("Content-Type", "multipart/form-data; boundary=XyZ")
            .body("--XyZ\r\nContent-Disposition: form-data; name=\"f\"")
            .build()
            .unwrap(),
    )
    .await;
    assert_eq!(response.status, StatusCode::BadRequest);
}

#[tokio::test]
async fn test_post_without_upload_dir_is_forbidden() {
    let site = site();
    let response = send(&site, request(Method::POST, "/drop/x").body("x").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::Forbidden);

    let response = send(&site, request(Method::POST, "/files/x").body("x").build().unwrap()).await;
    assert_eq!(response.status, StatusCode::MethodNotAllowed);
}

#[test]
fn test_fault_response_closes() {
    let site = site();
    let response = site.dispatcher.fault_response(StatusCode::BadRequest);
    assert!(response.close);
    assert_eq!(response.status, StatusCode::BadRequest);
}
