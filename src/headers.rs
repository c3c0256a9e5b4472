//! WebDAV 请求头解析：Depth、Timeout、Overwrite、Destination、If、Lock-Token、Range。

use axum::http::{HeaderMap, HeaderValue, header};
use std::time::Duration;
use url::Url;

use crate::error::DavError;
use crate::path::{DavPath, strip_mount};
use crate::store::ByteRange;

pub const DEPTH: &str = "depth";
pub const TIMEOUT: &str = "timeout";
pub const OVERWRITE: &str = "overwrite";
pub const DESTINATION: &str = "destination";
pub const IF: &str = "if";
pub const LOCK_TOKEN: &str = "lock-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, DavError> {
    match headers.get(name) {
        Some(value) => value
            .to_str()
            .map(|value| Some(value.trim()))
            .map_err(|_| DavError::InvalidRequest(format!("invalid {name} header"))),
        None => Ok(None),
    }
}

/// 解析 `Depth`；缺省时返回 `default`。
pub fn parse_depth(headers: &HeaderMap, default: Depth) -> Result<Depth, DavError> {
    match header_str(headers, DEPTH)? {
        None => Ok(default),
        Some("0") => Ok(Depth::Zero),
        Some("1") => Ok(Depth::One),
        Some(value) if value.eq_ignore_ascii_case("infinity") => Ok(Depth::Infinity),
        Some(value) => Err(DavError::InvalidRequest(format!("invalid Depth: {value}"))),
    }
}

/// 解析 `Timeout: Second-N, Infinite, ...`；取第一个可用项，上限为 `max`。
pub fn parse_timeout(headers: &HeaderMap, default: Duration, max: Duration) -> Duration {
    let Ok(Some(value)) = header_str(headers, TIMEOUT) else {
        return default.min(max);
    };
    for entry in value.split(',').map(str::trim) {
        if entry.eq_ignore_ascii_case("infinite") {
            return max;
        }
        if let Some(seconds) = entry
            .get(..7)
            .filter(|scheme| scheme.eq_ignore_ascii_case("second-"))
            .and_then(|_| entry[7..].parse::<u64>().ok())
        {
            return Duration::from_secs(seconds).min(max);
        }
    }
    default.min(max)
}

/// `Overwrite: T|F`；缺省时返回 `default`。
pub fn parse_overwrite(headers: &HeaderMap, default: bool) -> Result<bool, DavError> {
    match header_str(headers, OVERWRITE)? {
        None => Ok(default),
        Some(value) if value.eq_ignore_ascii_case("t") => Ok(true),
        Some(value) if value.eq_ignore_ascii_case("f") => Ok(false),
        Some(value) => Err(DavError::InvalidRequest(format!("invalid Overwrite: {value}"))),
    }
}

/// 将 `Destination` 解析为挂载前缀下的路径。
///
/// 接受绝对 URL（若同时存在 `Host`，其主机部分必须一致）或绝对路径。
pub fn parse_destination(headers: &HeaderMap, prefix: &str) -> Result<DavPath, DavError> {
    let Some(value) = header_str(headers, DESTINATION)? else {
        return Err(DavError::InvalidRequest("missing Destination header".into()));
    };
    let raw_path = match Url::parse(value) {
        Ok(url) => {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(DavError::InvalidRequest("unsupported Destination scheme".into()));
            }
            if let Some(host) = header_str(headers, header::HOST.as_str())?
                && !same_authority(&url, host)
            {
                return Err(DavError::InvalidRequest(
                    "Destination points at another server".into(),
                ));
            }
            url.path().to_string()
        }
        Err(url::ParseError::RelativeUrlWithoutBase) if value.starts_with('/') => {
            value.split(['?', '#']).next().unwrap_or_default().to_string()
        }
        Err(_) => return Err(DavError::InvalidRequest("unparsable Destination".into())),
    };
    let Some(inner) = strip_mount(prefix, &raw_path) else {
        return Err(DavError::InvalidRequest("Destination outside the mount point".into()));
    };
    DavPath::parse(inner)
}

fn same_authority(url: &Url, host_header: &str) -> bool {
    let (host, port) = split_host_port(host_header);
    let Some(url_host) = url.host_str() else {
        return false;
    };
    let url_host = url_host.trim_start_matches('[').trim_end_matches(']');
    if !url_host.eq_ignore_ascii_case(host) {
        return false;
    }
    match port {
        Some(port) => url.port_or_known_default() == Some(port),
        None => url.port().is_none(),
    }
}

fn split_host_port(value: &str) -> (&str, Option<u16>) {
    if let Some(rest) = value.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return (value, None);
        };
        let port = tail.strip_prefix(':').and_then(|port| port.parse().ok());
        return (host, port);
    }
    match value.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (value, None),
        },
        None => (value, None),
    }
}

/// 从 `If` 头中提取 `(<token>)` 形式的锁令牌；`Not <token>` 条件不算作持有。
pub fn submitted_tokens(headers: &HeaderMap) -> Vec<String> {
    let Ok(Some(value)) = header_str(headers, IF) else {
        return Vec::new();
    };
    let mut tokens = Vec::new();
    let mut in_list = false;
    let mut negated = false;
    let mut word = String::new();
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if in_list && ch.is_ascii_alphabetic() {
            word.push(ch);
            continue;
        }
        if !word.is_empty() {
            negated = word.eq_ignore_ascii_case("not");
            word.clear();
        }
        match ch {
            '(' => {
                in_list = true;
                negated = false;
            }
            ')' => in_list = false,
            '[' if in_list => {
                for skipped in chars.by_ref() {
                    if skipped == ']' {
                        break;
                    }
                }
                negated = false;
            }
            '<' => {
                let token: String = chars.by_ref().take_while(|ch| *ch != '>').collect();
                if in_list && !negated && !token.is_empty() {
                    tokens.push(token);
                }
                negated = false;
            }
            _ => {}
        }
    }
    tokens
}

/// `Lock-Token: <token>`，UNLOCK 必需。
pub fn parse_lock_token(headers: &HeaderMap) -> Result<String, DavError> {
    let Some(value) = header_str(headers, LOCK_TOKEN)? else {
        return Err(DavError::InvalidRequest("missing Lock-Token header".into()));
    };
    let token = value.trim_start_matches('<').trim_end_matches('>').trim();
    if token.is_empty() {
        return Err(DavError::InvalidRequest("empty Lock-Token header".into()));
    }
    Ok(token.to_string())
}

/// 解析单个 `bytes=` 区间；不支持多区间。
pub fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<ByteRange>, DavError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(DavError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| DavError::InvalidRequest("invalid Range header".into()))?;
    let Some(range) = value.trim().strip_prefix("bytes=") else {
        return Err(DavError::InvalidRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(DavError::InvalidRequest("multiple ranges not supported".into()));
    }

    let (start_part, end_part) = range.split_once('-').unwrap_or((range, ""));
    let invalid = |_| DavError::InvalidRequest("invalid Range header".into());

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part.parse().map_err(invalid)?;
        if suffix == 0 {
            return Err(DavError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part.parse().map_err(invalid)?;
        let end: u64 = if end_part.is_empty() {
            file_size - 1
        } else {
            end_part.parse().map_err(invalid)?
        };
        (start, end.min(file_size - 1))
    };

    if start > end || start >= file_size {
        return Err(DavError::RangeNotSatisfiable(file_size));
    }
    Ok(Some(ByteRange { start, end }))
}
