//! Total classification of raw failures into the error taxonomy.

use chrono::Utc;
use std::io;
use tracing::debug;

use crate::error::{EnhancedError, ErrorContext, ErrorKind, RawError};

/// Classify a raw failure.
///
/// Never fails: anything that doesn't match a known shape becomes
/// [`ErrorKind::Unknown`] and is not retryable.
pub fn classify(raw: RawError, context: &ErrorContext) -> EnhancedError {
  let kind = kind_of(&raw);
  let mut context = context.clone();
  context.timestamp = Utc::now();

  debug!(
    domain = %context.domain,
    operation = %context.operation,
    code = kind.code(),
    "classified failure: {}",
    raw
  );

  EnhancedError::new(kind, raw.to_string(), context).with_original(raw)
}

fn kind_of(raw: &RawError) -> ErrorKind {
  match raw {
    RawError::Status { status, .. } => kind_for_status(*status),
    RawError::Transport(e) => kind_for_transport(e),
    RawError::Io(e) => kind_for_io(e).unwrap_or_else(|| kind_for_message(&e.to_string())),
    RawError::Message(message) => kind_for_message(message),
    RawError::Report(report) => kind_for_report(report),
    RawError::Panic(_) => ErrorKind::Unknown,
  }
}

/// Map an HTTP status code to an error kind.
pub fn kind_for_status(status: u16) -> ErrorKind {
  match status {
    400 | 409 | 422 => ErrorKind::Validation,
    404 | 410 => ErrorKind::NotFound,
    408 | 504 => ErrorKind::Timeout,
    500..=599 => ErrorKind::Server,
    400..=499 => ErrorKind::Api,
    _ => ErrorKind::Unknown,
  }
}

fn kind_for_transport(e: &reqwest::Error) -> ErrorKind {
  if e.is_timeout() {
    return ErrorKind::Timeout;
  }
  if let Some(status) = e.status() {
    return kind_for_status(status.as_u16());
  }
  if e.is_connect() || e.is_request() {
    return ErrorKind::Network;
  }
  if e.is_decode() || e.is_body() {
    return ErrorKind::Api;
  }
  ErrorKind::Unknown
}

fn kind_for_io(e: &io::Error) -> Option<ErrorKind> {
  match e.kind() {
    io::ErrorKind::TimedOut => Some(ErrorKind::Timeout),
    io::ErrorKind::ConnectionRefused
    | io::ErrorKind::ConnectionReset
    | io::ErrorKind::ConnectionAborted
    | io::ErrorKind::NotConnected
    | io::ErrorKind::BrokenPipe
    | io::ErrorKind::AddrNotAvailable => Some(ErrorKind::Network),
    _ => None,
  }
}

fn kind_for_report(report: &color_eyre::Report) -> ErrorKind {
  for cause in report.chain() {
    if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
      return kind_for_transport(e);
    }
    if let Some(kind) = cause.downcast_ref::<io::Error>().and_then(kind_for_io) {
      return kind;
    }
    if let Some(e) = cause.downcast_ref::<RawError>() {
      return kind_of(e);
    }
  }
  kind_for_message(&format!("{:#}", report))
}

fn kind_for_message(message: &str) -> ErrorKind {
  let message = message.to_lowercase();
  let has = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

  if has(&["timed out", "timeout"]) {
    ErrorKind::Timeout
  } else if has(&["network", "connection", "offline", "dns", "unreachable"]) {
    ErrorKind::Network
  } else if has(&["not found"]) {
    ErrorKind::NotFound
  } else if has(&["invalid", "validation", "required", "must be"]) {
    ErrorKind::Validation
  } else {
    ErrorKind::Unknown
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::{eyre, WrapErr};
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  fn ctx() -> ErrorContext {
    ErrorContext::new("user", "load").with_detail("id", "u1")
  }

  fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
  }

  /// Accept one request on a local port and answer with `response` verbatim,
  /// or hold the connection open without answering when it is `None`.
  async fn serve_once(response: Option<&'static str>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut request = [0u8; 1024];
      let _ = socket.read(&mut request).await;
      match response {
        Some(response) => {
          let _ = socket.write_all(response.as_bytes()).await;
          let _ = socket.shutdown().await;
        }
        None => tokio::time::sleep(Duration::from_secs(5)).await,
      }
    });
    format!("http://{}/users/u1", addr)
  }

  fn assert_transport(error: reqwest::Error, kind: ErrorKind) -> EnhancedError {
    let classified = classify(error.into(), &ctx());
    assert_eq!(classified.kind, kind, "{}", classified.message);
    assert_eq!(classified.retryable, kind.default_retryable());
    assert!(matches!(classified.original.as_deref(), Some(RawError::Transport(_))));
    classified
  }

  #[test]
  fn test_status_codes() {
    let cases = [
      (400, ErrorKind::Validation),
      (422, ErrorKind::Validation),
      (404, ErrorKind::NotFound),
      (408, ErrorKind::Timeout),
      (504, ErrorKind::Timeout),
      (500, ErrorKind::Server),
      (503, ErrorKind::Server),
      (401, ErrorKind::Api),
      (429, ErrorKind::Api),
      (302, ErrorKind::Unknown),
    ];
    for (status, kind) in cases {
      let error = classify(RawError::status(status, "nope"), &ctx());
      assert_eq!(error.kind, kind, "status {}", status);
      assert_eq!(error.retryable, kind.default_retryable());
    }
  }

  #[test]
  fn test_message_shapes() {
    let cases = [
      ("Connection timed out", ErrorKind::Timeout),
      ("network unreachable", ErrorKind::Network),
      ("device is offline", ErrorKind::Network),
      ("Team not found", ErrorKind::NotFound),
      ("email is required", ErrorKind::Validation),
      ("something odd", ErrorKind::Unknown),
    ];
    for (message, kind) in cases {
      assert_eq!(classify(RawError::from(message), &ctx()).kind, kind, "{}", message);
    }
  }

  #[test]
  fn test_io_errors() {
    let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
    assert_eq!(classify(refused.into(), &ctx()).kind, ErrorKind::Network);

    let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
    assert_eq!(classify(timed_out.into(), &ctx()).kind, ErrorKind::Timeout);
  }

  #[test]
  fn test_report_chain_is_walked() {
    let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
    let report = Err::<(), _>(io)
      .wrap_err("failed to load team")
      .unwrap_err();
    assert_eq!(classify(report.into(), &ctx()).kind, ErrorKind::Network);

    let plain = eyre!("weird state");
    assert_eq!(classify(plain.into(), &ctx()).kind, ErrorKind::Unknown);
  }

  #[tokio::test]
  async fn test_refused_connection_is_network() {
    let addr = {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap()
    };

    let error = client()
      .get(format!("http://{}/users/u1", addr))
      .send()
      .await
      .unwrap_err();
    assert!(error.is_connect());
    let classified = assert_transport(error, ErrorKind::Network);
    assert!(classified.retryable);
  }

  #[tokio::test]
  async fn test_client_timeout_is_timeout() {
    let url = serve_once(None).await;
    let client = reqwest::Client::builder()
      .no_proxy()
      .timeout(Duration::from_millis(100))
      .build()
      .unwrap();

    let error = client.get(url).send().await.unwrap_err();
    assert!(error.is_timeout());
    let classified = assert_transport(error, ErrorKind::Timeout);
    assert!(classified.retryable);
  }

  #[tokio::test]
  async fn test_undecodable_body_is_api() {
    let url = serve_once(Some(
      "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 9\r\n\
       Connection: close\r\n\r\nnot json!",
    ))
    .await;

    let response = client().get(url).send().await.unwrap();
    let error = response.json::<serde_json::Value>().await.unwrap_err();
    assert!(error.is_decode());
    let classified = assert_transport(error, ErrorKind::Api);
    assert!(classified.retryable);
  }

  #[tokio::test]
  async fn test_transport_status_is_carried() {
    let url = serve_once(Some(
      "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    ))
    .await;

    let response = client().get(url).send().await.unwrap();
    let error = response.error_for_status().unwrap_err();
    let classified = assert_transport(error, ErrorKind::Server);
    assert!(classified.retryable);
    assert_eq!(
      classified.original.as_deref().and_then(RawError::status_code),
      Some(503)
    );
  }

  #[tokio::test]
  async fn test_transport_error_inside_report() {
    let addr = {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap()
    };
    let report = client()
      .get(format!("http://{}/users/u1", addr))
      .send()
      .await
      .wrap_err("failed to load user")
      .unwrap_err();

    let classified = classify(report.into(), &ctx());
    assert_eq!(classified.kind, ErrorKind::Network);
    assert!(classified.retryable);
  }

  #[test]
  fn test_unknown_shapes_are_not_retryable() {
    let error = classify(RawError::Panic("index out of bounds".into()), &ctx());
    assert_eq!(error.kind, ErrorKind::Unknown);
    assert!(!error.retryable);
  }

  #[test]
  fn test_context_and_original_preserved() {
    let error = classify(RawError::status(503, "maintenance"), &ctx());
    assert_eq!(error.code(), "SERVER_ERROR");
    assert_eq!(error.context.domain, "user");
    assert_eq!(error.context.operation, "load");
    assert_eq!(error.context.details.get("id").map(String::as_str), Some("u1"));

    let original = error.original.as_deref();
    assert!(matches!(
      original,
      Some(RawError::Status { status: 503, message }) if message == "maintenance"
    ));
  }
}
