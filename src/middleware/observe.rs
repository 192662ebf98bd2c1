//! Body instrumentation shared by the access log and metrics middlewares.
//!
//! Byte counts come from the data frames actually produced or consumed, not
//! from `Content-Length`. Completion fires once, when the response body is
//! dropped, which happens after it has been fully written (or abandoned).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use http_body_util::BodyExt;

/// What was sent back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseSummary {
    pub status: StatusCode,
    /// Response body bytes produced.
    pub bytes: u64,
}

/// Fires the callback on drop with the bytes seen so far.
struct Completion<F>
where
    F: FnOnce(ResponseSummary),
{
    status: StatusCode,
    bytes: u64,
    on_complete: Option<F>,
}

impl<F> Drop for Completion<F>
where
    F: FnOnce(ResponseSummary),
{
    fn drop(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(ResponseSummary {
                status: self.status,
                bytes: self.bytes,
            });
        }
    }
}

/// Wrap the response body so `on_complete` runs once it is finished.
pub fn observe_response<F>(response: Response<Body>, on_complete: F) -> Response<Body>
where
    F: FnOnce(ResponseSummary) + Send + 'static,
{
    let (parts, body) = response.into_parts();
    let mut completion = Completion {
        status: parts.status,
        bytes: 0,
        on_complete: Some(on_complete),
    };

    // Borrow the whole struct so the closure owns it, not just `bytes`.
    let body = body.map_frame(move |frame| {
        let completion = &mut completion;
        if let Some(data) = frame.data_ref() {
            completion.bytes += data.len() as u64;
        }
        frame
    });

    Response::from_parts(parts, Body::new(body))
}

/// Count the request body bytes the inner service reads.
///
/// Returns the request with its body wrapped and a shared counter.
pub fn count_request_body(req: Request<Body>) -> (Request<Body>, Arc<AtomicU64>) {
    let counter = Arc::new(AtomicU64::new(0));
    let seen = counter.clone();

    let (parts, body) = req.into_parts();
    let body = body.map_frame(move |frame| {
        if let Some(data) = frame.data_ref() {
            seen.fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        frame
    });

    (Request::from_parts(parts, Body::new(body)), counter)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_summary_after_body_consumed() {
        let seen: Arc<Mutex<Option<ResponseSummary>>> = Arc::default();
        let sink = seen.clone();

        let response = Response::builder()
            .status(StatusCode::CREATED)
            .body(Body::from("hello world"))
            .unwrap();
        let response = observe_response(response, move |summary| {
            *sink.lock() = Some(summary);
        });
        assert!(seen.lock().is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello world");
        assert_eq!(
            *seen.lock(),
            Some(ResponseSummary {
                status: StatusCode::CREATED,
                bytes: 11,
            })
        );
    }

    #[tokio::test]
    async fn test_summary_counts_streamed_frames() {
        let seen: Arc<Mutex<Option<ResponseSummary>>> = Arc::default();
        let sink = seen.clone();

        let chunks = futures::stream::iter(["ab", "cde", "fghij"].map(|c| {
            Ok::<_, std::io::Error>(axum::body::Bytes::from_static(c.as_bytes()))
        }));
        let response = observe_response(
            Response::new(Body::from_stream(chunks)),
            move |summary| *sink.lock() = Some(summary),
        );

        let mut body = response.into_body();
        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.data_ref().map(|d| d.len()), Some(2));
        assert!(seen.lock().is_none(), "fired before the body was finished");

        while body.frame().await.is_some() {}
        assert!(seen.lock().is_none(), "fired while the body was still alive");
        drop(body);

        assert_eq!(seen.lock().unwrap().bytes, 10);
    }

    #[test]
    fn test_summary_on_drop_without_reading() {
        let seen: Arc<Mutex<Option<ResponseSummary>>> = Arc::default();
        let sink = seen.clone();

        let response = observe_response(Response::new(Body::from("unread")), move |summary| {
            *sink.lock() = Some(summary);
        });
        drop(response);

        let summary = seen.lock().unwrap();
        assert_eq!(summary.status, StatusCode::OK);
        assert_eq!(summary.bytes, 0);
    }

    #[tokio::test]
    async fn test_request_body_counter() {
        let req = Request::new(Body::from("0123456789"));
        let (req, counter) = count_request_body(req);
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        req.into_body().collect().await.unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }
}
