//! Loopback axum app for exercising the blocking adapters in tests.
//!
//! The server runs on its own thread with its own tokio runtime, so the
//! blocking reqwest clients under test never touch an async context.

use std::collections::VecDeque;
use std::net::TcpListener as StdTcpListener;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;

pub(crate) struct CannedResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl CannedResponse {
    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    pub fn bytes(status: u16, content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RecordedRequest {
    pub method: Method,
    /// Path plus query string, as sent.
    pub target: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn body_json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

#[derive(Clone)]
struct Responder {
    responses: Arc<Mutex<VecDeque<CannedResponse>>>,
    recorded: Arc<Mutex<mpsc::Sender<RecordedRequest>>>,
}

async fn respond(
    State(responder): State<Responder>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = uri
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    if let Ok(sender) = responder.recorded.lock() {
        // A dropped receiver only means the test stopped looking.
        sender
            .send(RecordedRequest {
                method,
                target,
                headers,
                body: body.to_vec(),
            })
            .ok();
    }
    let next = responder
        .responses
        .lock()
        .ok()
        .and_then(|mut queue| queue.pop_front());
    let Some(canned) = next else {
        return (StatusCode::GONE, "no canned response left").into_response();
    };
    let status = StatusCode::from_u16(canned.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(CONTENT_TYPE, canned.content_type)], canned.body).into_response()
}

/// Answers requests with `responses` in order on `127.0.0.1:<random>`.
/// Returns the base URL and a channel yielding each request as it arrives.
pub(crate) fn serve(
    responses: Vec<CannedResponse>,
) -> anyhow::Result<(String, mpsc::Receiver<RecordedRequest>)> {
    let listener = StdTcpListener::bind("127.0.0.1:0")?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::channel();
    let app = Router::new().fallback(respond).with_state(Responder {
        responses: Arc::new(Mutex::new(responses.into())),
        recorded: Arc::new(Mutex::new(tx)),
    });
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::spawn(move || {
        let served = runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener)?;
            axum::serve(listener, app).await
        });
        if let Err(err) = served {
            eprintln!("loopback server stopped: {err}");
        }
    });
    Ok((format!("http://{addr}"), rx))
}

/// A base URL nothing listens on.
pub(crate) fn closed_base_url() -> anyhow::Result<String> {
    let listener = StdTcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(format!("http://{addr}"))
}

pub(crate) fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let mut image = RgbImage::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = Rgb(color);
    }
    let mut out = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode test png");
    out.into_inner()
}
