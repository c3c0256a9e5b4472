//! ETag 计算与条件请求校验。

use axum::http::{HeaderMap, header};
use httpdate::parse_http_date;
use std::time::SystemTime;

use crate::error::DavError;
use crate::store::Node;

/// 根据节点元数据生成弱 ETag。
pub fn etag_for_node(node: &Node) -> String {
    let modified = node.modified_at;
    format!(
        "W/\"{}-{}-{}-{}\"",
        node.uid,
        node.size,
        modified.timestamp(),
        modified.timestamp_subsec_nanos()
    )
}

/// 校验 If-Match / If-None-Match 条件。
pub fn check_preconditions(
    headers: &HeaderMap,
    current_etag: Option<&str>,
    exists: bool,
) -> Result<(), DavError> {
    if let Some(value) = headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok()) {
        if value.trim() == "*" {
            if !exists {
                return Err(DavError::PreconditionFailed("If-Match".into()));
            }
        } else if !etag_matches(value, current_etag) {
            return Err(DavError::PreconditionFailed("If-Match".into()));
        }
    }

    if let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if value.trim() == "*" {
            if exists {
                return Err(DavError::PreconditionFailed("If-None-Match".into()));
            }
        } else if etag_matches(value, current_etag) {
            return Err(DavError::PreconditionFailed("If-None-Match".into()));
        }
    }

    Ok(())
}

/// `If-Range`：实体标签或 HTTP 日期；缺省时范围请求始终生效。
pub fn if_range_matches(headers: &HeaderMap, node: &Node) -> bool {
    let Some(value) = headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    else {
        return true;
    };
    let value = value.trim();
    if value.starts_with('"') || value.starts_with("W/") {
        return value == etag_for_node(node);
    }
    match parse_http_date(value) {
        Ok(date) => SystemTime::from(node.modified_at) <= date,
        Err(_) => false,
    }
}

fn etag_matches(header_value: &str, current: Option<&str>) -> bool {
    let current = match current {
        Some(value) => value,
        None => return false,
    };
    header_value
        .split(',')
        .map(|item| item.trim())
        .any(|item| item == current)
}
