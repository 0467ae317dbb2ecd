//! HTTP 响应封装与错误映射。
//!
//! 所有响应统一为 `{ success, data, error }`；错误码与 HTTP 状态一一对应。

use crate::control::ControlError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// 标准响应体。
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

pub fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
}

pub fn bad_request_error(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::<()>::error("INVALID.REQUEST", message.into())),
    )
        .into_response()
}

pub fn control_error(err: ControlError) -> Response {
    let (status, code) = match &err {
        ControlError::UnknownConnector(_) => (StatusCode::NOT_FOUND, "RESOURCE.NOT_FOUND"),
        ControlError::Fault(_) => (StatusCode::CONFLICT, "FAULT.REJECTED"),
        ControlError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE.UNAVAILABLE"),
    };
    (
        status,
        Json(ApiResponse::<()>::error(code, err.to_string())),
    )
        .into_response()
}
