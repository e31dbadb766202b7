use std::collections::HashMap;

use axum::body::Body;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult, ErrorResponse};

/// Uniform JSON envelope written for every request the handler did not
/// answer itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

impl ApiResponse {
    pub fn ok(request_id: &str, data: serde_json::Value) -> Self {
        Self {
            request_id: request_id.to_string(),
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(request_id: &str, error: ErrorResponse) -> Self {
        Self {
            request_id: request_id.to_string(),
            success: false,
            data: serde_json::Value::Null,
            error: Some(error),
        }
    }
}

/// Outgoing response under construction, shared by every node of a request.
///
/// Anything written through [`Response::write`], [`Response::write_json`] or
/// [`Response::send_file`] marks the response as answered, which suppresses
/// the envelope.
#[derive(Debug, Default)]
pub struct Response {
    state: Mutex<ResponseState>,
}

#[derive(Debug)]
struct ResponseState {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    responded: bool,
    /// Values nodes hand to each other on the way out; never sent.
    data: HashMap<String, serde_json::Value>,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            responded: false,
            data: HashMap::new(),
        }
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> StatusCode {
        self.state.lock().status
    }

    pub fn set_status(&self, status: StatusCode) {
        self.state.lock().status = status;
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn set_header(&self, name: &str, value: &str) -> ApiResult<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ApiError::InternalServerError(format!("bad header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ApiError::InternalServerError(format!("bad header value: {e}")))?;
        self.state.lock().headers.insert(name, value);
        Ok(())
    }

    /// Appends raw bytes to the body.
    pub fn write(&self, data: &[u8]) {
        let mut state = self.state.lock();
        state.body.extend_from_slice(data);
        state.responded = true;
    }

    pub fn write_json<T: Serialize>(&self, value: &T) -> ApiResult<()> {
        let body = serde_json::to_vec(value)?;
        let mut state = self.state.lock();
        state
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        state.body = BytesMut::from(&body[..]);
        state.responded = true;
        Ok(())
    }

    /// Answers with `data` as a download named `file_name`.
    pub fn send_file(&self, status: StatusCode, file_name: &str, data: &[u8]) -> ApiResult<()> {
        self.set_header(
            CONTENT_DISPOSITION.as_str(),
            &format!("attachment; filename={file_name}"),
        )?;
        let mut state = self.state.lock();
        state
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        state.status = status;
        state.body = BytesMut::from(data);
        state.responded = true;
        Ok(())
    }

    /// Tells the dispatcher the handler produced the response itself.
    pub fn mark_responded(&self) {
        self.state.lock().responded = true;
    }

    /// Stores `value` under `key` for nodes that run later, e.g. an
    /// interceptor's post-processing.
    pub fn set_data(&self, key: &str, value: serde_json::Value) {
        self.state.lock().data.insert(key.to_string(), value);
    }

    pub fn data(&self, key: &str) -> Option<serde_json::Value> {
        self.state.lock().data.get(key).cloned()
    }

    pub fn is_responded(&self) -> bool {
        self.state.lock().responded
    }

    pub fn body(&self) -> Bytes {
        self.state.lock().body.clone().freeze()
    }

    /// Renders the accumulated state, leaving it empty.
    pub fn take(&self) -> axum::response::Response {
        let state = std::mem::take(&mut *self.state.lock());
        let mut response = axum::response::Response::new(Body::from(state.body.freeze()));
        *response.status_mut() = state.status;
        *response.headers_mut() = state.headers;
        response
    }

    /// Replaces the body with the envelope unless the handler already answered.
    pub(crate) fn envelope(&self, status: StatusCode, envelope: &ApiResponse) {
        if self.is_responded() {
            return;
        }
        match serde_json::to_vec(envelope) {
            Ok(body) => {
                let mut state = self.state.lock();
                state.status = status;
                state
                    .headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                state.body = BytesMut::from(&body[..]);
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.status = StatusCode::INTERNAL_SERVER_ERROR;
                state.body = BytesMut::from(e.to_string().as_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let ok = serde_json::to_value(ApiResponse::ok("r1", json!({"id": 1}))).unwrap();
        assert_eq!(ok, json!({"request_id": "r1", "success": true, "data": {"id": 1}}));

        let failed = ApiResponse::failed("r2", ErrorResponse::new("not_found", "user 9", 404));
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"]["code"], json!(404));
        assert!(value.get("data").is_none());

        let back: ApiResponse = serde_json::from_value(value).unwrap();
        assert_eq!(back, failed);
    }

    #[test]
    fn test_envelope_suppressed_after_raw_write() {
        let resp = Response::new();
        resp.set_status(StatusCode::CREATED);
        resp.write(b"plain");
        resp.envelope(StatusCode::OK, &ApiResponse::ok("r", json!(1)));

        assert!(resp.is_responded());
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(&resp.body()[..], b"plain");
    }

    #[test]
    fn test_envelope_written() {
        let resp = Response::new();
        resp.envelope(StatusCode::NOT_FOUND, &ApiResponse::ok("r", json!(null)));
        let http = resp.take();
        assert_eq!(http.status(), StatusCode::NOT_FOUND);
        assert_eq!(http.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_send_file_headers() {
        let resp = Response::new();
        resp.send_file(StatusCode::OK, "report.csv", b"a,b\n").unwrap();
        assert_eq!(
            resp.header("content-disposition").as_deref(),
            Some("attachment; filename=report.csv")
        );
        assert_eq!(resp.header("content-type").as_deref(), Some("application/octet-stream"));
        assert!(resp.is_responded());
    }

    #[test]
    fn test_response_data_is_not_rendered() {
        let resp = Response::new();
        assert!(resp.data("user_id").is_none());
        resp.set_data("user_id", json!(42));
        resp.set_data("user_id", json!(43));
        assert_eq!(resp.data("user_id"), Some(json!(43)));
        assert!(!resp.is_responded());

        resp.envelope(StatusCode::OK, &ApiResponse::ok("r", json!(null)));
        let body = resp.body();
        assert!(!String::from_utf8_lossy(&body).contains("43"));
    }

    #[test]
    fn test_write_json_marks_responded() {
        let resp = Response::new();
        resp.write_json(&json!({"raw": true})).unwrap();
        assert!(resp.is_responded());
        assert_eq!(&resp.body()[..], br#"{"raw":true}"#);
    }
}
