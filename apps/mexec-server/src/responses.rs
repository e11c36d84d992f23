use axum::{http::StatusCode, response::IntoResponse, Json};
use mexec_protocol::ProblemDetails;

pub fn problem_response(
    status: StatusCode,
    title: &str,
    detail: Option<&str>,
) -> axum::response::Response {
    let body = ProblemDetails {
        r#type: "about:blank".into(),
        title: title.into(),
        status: status.as_u16(),
        detail: detail.map(str::to_string),
        instance: None,
        trace_id: None,
        code: None,
    };
    (status, Json(body)).into_response()
}

/// Generic admission rejections; never say which check failed.
pub fn unauthorized() -> axum::response::Response {
    problem_response(StatusCode::UNAUTHORIZED, "Unauthorized", None)
}

pub fn forbidden() -> axum::response::Response {
    problem_response(StatusCode::FORBIDDEN, "Forbidden", None)
}

pub fn not_found(detail: &str) -> axum::response::Response {
    problem_response(StatusCode::NOT_FOUND, "Not Found", Some(detail))
}
