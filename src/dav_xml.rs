//! WebDAV XML：请求体解析（xmltree）与响应输出（xml-rs）。

use chrono::Utc;
use std::io::Write;
use xml::common::XmlVersion;
use xml::writer::{EventWriter, XmlEvent};
use xml::EmitterConfig;
use xmltree::{Element, XMLNode};

use crate::error::DavError;
use crate::webdav_lock::{Lock, LockDepth, LockScope};

pub const DAV_NS: &str = "DAV:";
pub const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

/// 请求体中出现的属性名。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropName {
    pub namespace: Option<String>,
    pub name: String,
}

impl PropName {
    pub fn is_dav(&self) -> bool {
        self.namespace.as_deref() == Some(DAV_NS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropfindRequest {
    AllProp,
    PropName,
    Props(Vec<PropName>),
}

/// 创建锁的 `LOCK` 请求体。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub scope: LockScope,
    pub owner: Option<String>,
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

fn parse_root(body: &[u8], expected: &str) -> Result<Element, DavError> {
    let root = Element::parse(body)
        .map_err(|err| DavError::InvalidRequest(format!("malformed XML body: {err}")))?;
    if root.name != expected || root.namespace.as_deref() != Some(DAV_NS) {
        return Err(DavError::InvalidRequest(format!(
            "expected DAV:{expected}, found {}",
            root.name
        )));
    }
    Ok(root)
}

fn child_elements(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(child) => Some(child),
        _ => None,
    })
}

fn dav_child<'a>(element: &'a Element, name: &str) -> Option<&'a Element> {
    child_elements(element)
        .find(|child| child.name == name && child.namespace.as_deref() == Some(DAV_NS))
}

/// 解析 PROPFIND 请求体；空请求体等同于 allprop。
pub fn parse_propfind(body: &[u8]) -> Result<PropfindRequest, DavError> {
    if is_blank(body) {
        return Ok(PropfindRequest::AllProp);
    }
    let root = parse_root(body, "propfind")?;
    if dav_child(&root, "allprop").is_some() {
        return Ok(PropfindRequest::AllProp);
    }
    if dav_child(&root, "propname").is_some() {
        return Ok(PropfindRequest::PropName);
    }
    let Some(prop) = dav_child(&root, "prop") else {
        return Err(DavError::InvalidRequest(
            "propfind needs allprop, propname, or prop".into(),
        ));
    };
    let names = child_elements(prop)
        .map(|element| PropName {
            namespace: element.namespace.clone(),
            name: element.name.clone(),
        })
        .collect();
    Ok(PropfindRequest::Props(names))
}

/// 解析 `lockinfo` 请求体；空请求体（刷新）返回 `None`。
pub fn parse_lockinfo(body: &[u8]) -> Result<Option<LockInfo>, DavError> {
    if is_blank(body) {
        return Ok(None);
    }
    let root = parse_root(body, "lockinfo")?;

    let scope = match dav_child(&root, "lockscope") {
        Some(scope) if dav_child(scope, "shared").is_some() => LockScope::Shared,
        Some(scope) if dav_child(scope, "exclusive").is_some() => LockScope::Exclusive,
        Some(_) => return Err(DavError::InvalidRequest("unknown lockscope".into())),
        None => LockScope::Exclusive,
    };
    if let Some(locktype) = dav_child(&root, "locktype")
        && dav_child(locktype, "write").is_none()
    {
        return Err(DavError::InvalidRequest("only write locks are supported".into()));
    }

    let owner = dav_child(&root, "owner").and_then(|owner| {
        let source = dav_child(owner, "href").unwrap_or(owner);
        source
            .get_text()
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
    });
    Ok(Some(LockInfo { scope, owner }))
}

/// 收集 propertyupdate 中 set/remove 涉及的属性名。
pub fn parse_proppatch(body: &[u8]) -> Result<Vec<PropName>, DavError> {
    let root = parse_root(body, "propertyupdate")?;
    let mut names = Vec::new();
    for action in child_elements(&root) {
        if action.namespace.as_deref() != Some(DAV_NS)
            || !matches!(action.name.as_str(), "set" | "remove")
        {
            continue;
        }
        let Some(prop) = dav_child(action, "prop") else {
            continue;
        };
        for element in child_elements(prop) {
            names.push(PropName {
                namespace: element.namespace.clone(),
                name: element.name.clone(),
            });
        }
    }
    Ok(names)
}

/// 写出 `name` 的空元素，非 `DAV:` 命名空间时附带声明。
fn write_prop_name<W: Write>(out: &mut EventWriter<W>, name: &PropName) -> Result<(), DavError> {
    match name.namespace.as_deref() {
        Some(DAV_NS) => empty_element(out, &format!("D:{}", name.name)),
        Some(namespace) => {
            let qualified = format!("U:{}", name.name);
            out.write(XmlEvent::start_element(qualified.as_str()).ns("U", namespace))?;
            out.write(XmlEvent::end_element())?;
            Ok(())
        }
        None => empty_element(out, &name.name),
    }
}

/// PROPPATCH 响应：所有属性均为只读，逐个返回 403。
pub fn proppatch_body(href: &str, names: &[PropName]) -> Result<Vec<u8>, DavError> {
    let mut out = new_document()?;
    out.write(XmlEvent::start_element("D:multistatus").ns("D", DAV_NS))?;
    out.write(XmlEvent::start_element("D:response"))?;
    text_element(&mut out, "D:href", href)?;
    for name in names {
        out.write(XmlEvent::start_element("D:propstat"))?;
        out.write(XmlEvent::start_element("D:prop"))?;
        write_prop_name(&mut out, name)?;
        out.write(XmlEvent::end_element())?;
        text_element(&mut out, "D:status", "HTTP/1.1 403 Forbidden")?;
        out.write(XmlEvent::end_element())?;
    }
    out.write(XmlEvent::end_element())?;
    out.write(XmlEvent::end_element())?;
    Ok(out.into_inner())
}

fn emitter_config() -> EmitterConfig {
    EmitterConfig {
        perform_indent: cfg!(debug_assertions),
        ..Default::default()
    }
}

/// 新建输出文档并写入 XML 声明。
pub fn new_document() -> Result<EventWriter<Vec<u8>>, DavError> {
    let mut out = EventWriter::new_with_config(Vec::new(), emitter_config());
    out.write(XmlEvent::StartDocument {
        version: XmlVersion::Version10,
        encoding: Some("utf-8"),
        standalone: None,
    })?;
    Ok(out)
}

/// `<name>text</name>`
pub fn text_element<W: Write>(
    out: &mut EventWriter<W>,
    name: &str,
    text: &str,
) -> Result<(), DavError> {
    out.write(XmlEvent::start_element(name))?;
    out.write(XmlEvent::characters(text))?;
    out.write(XmlEvent::end_element())?;
    Ok(())
}

/// `<name/>`
pub fn empty_element<W: Write>(out: &mut EventWriter<W>, name: &str) -> Result<(), DavError> {
    out.write(XmlEvent::start_element(name))?;
    out.write(XmlEvent::end_element())?;
    Ok(())
}

fn href_element<W: Write>(out: &mut EventWriter<W>, parent: &str, href: &str) -> Result<(), DavError> {
    out.write(XmlEvent::start_element(parent))?;
    text_element(out, "D:href", href)?;
    out.write(XmlEvent::end_element())?;
    Ok(())
}

fn scope_name(scope: LockScope) -> &'static str {
    match scope {
        LockScope::Exclusive => "D:exclusive",
        LockScope::Shared => "D:shared",
    }
}

pub fn write_supported_lock<W: Write>(out: &mut EventWriter<W>) -> Result<(), DavError> {
    out.write(XmlEvent::start_element("D:supportedlock"))?;
    for scope in [LockScope::Exclusive, LockScope::Shared] {
        out.write(XmlEvent::start_element("D:lockentry"))?;
        out.write(XmlEvent::start_element("D:lockscope"))?;
        empty_element(out, scope_name(scope))?;
        out.write(XmlEvent::end_element())?;
        out.write(XmlEvent::start_element("D:locktype"))?;
        empty_element(out, "D:write")?;
        out.write(XmlEvent::end_element())?;
        out.write(XmlEvent::end_element())?;
    }
    out.write(XmlEvent::end_element())?;
    Ok(())
}

pub fn write_lock_discovery<W: Write>(
    out: &mut EventWriter<W>,
    locks: &[Lock],
    prefix: &str,
) -> Result<(), DavError> {
    let now = Utc::now();
    out.write(XmlEvent::start_element("D:lockdiscovery"))?;
    for lock in locks {
        out.write(XmlEvent::start_element("D:activelock"))?;

        out.write(XmlEvent::start_element("D:locktype"))?;
        empty_element(out, "D:write")?;
        out.write(XmlEvent::end_element())?;

        out.write(XmlEvent::start_element("D:lockscope"))?;
        empty_element(out, scope_name(lock.scope))?;
        out.write(XmlEvent::end_element())?;

        let depth = match lock.depth {
            LockDepth::Zero => "0",
            LockDepth::Infinity => "infinity",
        };
        text_element(out, "D:depth", depth)?;
        if let Some(owner) = &lock.owner {
            href_element(out, "D:owner", owner)?;
        }
        text_element(
            out,
            "D:timeout",
            &format!("Second-{}", lock.remaining_secs(now)),
        )?;
        href_element(out, "D:locktoken", &lock.token)?;
        href_element(out, "D:lockroot", &lock.path.href(prefix, false))?;

        out.write(XmlEvent::end_element())?;
    }
    out.write(XmlEvent::end_element())?;
    Ok(())
}

/// LOCK 响应体：`<D:prop><D:lockdiscovery>…</D:lockdiscovery></D:prop>`。
pub fn lock_response_body(lock: &Lock, prefix: &str) -> Result<Vec<u8>, DavError> {
    let mut out = new_document()?;
    out.write(XmlEvent::start_element("D:prop").ns("D", DAV_NS))?;
    write_lock_discovery(&mut out, std::slice::from_ref(lock), prefix)?;
    out.write(XmlEvent::end_element())?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::DavPath;

    #[test]
    fn empty_propfind_is_allprop() {
        assert_eq!(parse_propfind(b"").unwrap(), PropfindRequest::AllProp);
        assert_eq!(parse_propfind(b"  \n").unwrap(), PropfindRequest::AllProp);
    }

    #[test]
    fn propfind_prop_list_keeps_namespaces() {
        let body = br#"<?xml version="1.0"?>
            <d:propfind xmlns:d="DAV:" xmlns:x="urn:example">
              <d:prop><d:getcontentlength/><x:color/></d:prop>
            </d:propfind>"#;
        let PropfindRequest::Props(names) = parse_propfind(body).unwrap() else {
            panic!("expected prop list");
        };
        assert_eq!(names.len(), 2);
        assert!(names[0].is_dav());
        assert_eq!(names[0].name, "getcontentlength");
        assert_eq!(names[1].namespace.as_deref(), Some("urn:example"));
    }

    #[test]
    fn propfind_rejects_garbage() {
        assert!(parse_propfind(b"<not-xml").is_err());
        assert!(parse_propfind(br#"<a:other xmlns:a="DAV:"/>"#).is_err());
    }

    #[test]
    fn lockinfo_scope_and_owner() {
        let body = br#"<D:lockinfo xmlns:D="DAV:">
              <D:lockscope><D:shared/></D:lockscope>
              <D:locktype><D:write/></D:locktype>
              <D:owner><D:href>mailto:someone@example.com</D:href></D:owner>
            </D:lockinfo>"#;
        let info = parse_lockinfo(body).unwrap().unwrap();
        assert_eq!(info.scope, LockScope::Shared);
        assert_eq!(info.owner.as_deref(), Some("mailto:someone@example.com"));
        assert!(parse_lockinfo(b"").unwrap().is_none());
    }

    #[test]
    fn proppatch_names_come_back_forbidden() {
        let body = br#"<D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:schemas-microsoft-com:">
              <D:set><D:prop><Z:Win32LastModifiedTime>x</Z:Win32LastModifiedTime></D:prop></D:set>
              <D:remove><D:prop><D:displayname/></D:prop></D:remove>
            </D:propertyupdate>"#;
        let names = parse_proppatch(body).unwrap();
        assert_eq!(names.len(), 2);
        let out = String::from_utf8(proppatch_body("/a.txt", &names).unwrap()).unwrap();
        assert_eq!(out.matches("HTTP/1.1 403 Forbidden").count(), 2);
        assert!(out.contains("Win32LastModifiedTime"));
        assert!(out.contains("urn:schemas-microsoft-com:"));
    }

    #[test]
    fn lock_body_contains_token_and_root() {
        let lock = Lock {
            token: "opaquelocktoken:abc".into(),
            path: DavPath::parse("/a b.txt").unwrap(),
            owner: Some("me & you".into()),
            scope: LockScope::Exclusive,
            depth: LockDepth::Zero,
            timeout_secs: 60,
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            provisional: false,
        };
        let body = String::from_utf8(lock_response_body(&lock, "/dav").unwrap()).unwrap();
        assert!(body.contains("opaquelocktoken:abc"));
        assert!(body.contains("/dav/a%20b.txt"));
        assert!(body.contains("me &amp; you"));
        assert!(body.contains("Second-"));
    }
}
