//! PROPFIND：按深度遍历节点树并生成 207 Multi-Status。

use chrono::SecondsFormat;
use httpdate::fmt_http_date;
use std::io::Write;
use std::time::SystemTime;
use tracing::debug;
use xml::writer::{EventWriter, XmlEvent};

use crate::adapter::ResourceAdapter;
use crate::dav_xml::{
    DAV_NS, PropfindRequest, empty_element, new_document, text_element, write_lock_discovery,
    write_supported_lock,
};
use crate::error::DavError;
use crate::etag::etag_for_node;
use crate::headers::Depth;
use crate::path::DavPath;
use crate::store::Node;
use crate::webdav_lock::{Lock, LockManager};

/// 服务支持的活属性，均位于 `DAV:` 命名空间。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    CreationDate,
    DisplayName,
    GetContentLength,
    GetContentType,
    GetEtag,
    GetLastModified,
    ResourceType,
    SupportedLock,
    LockDiscovery,
}

impl Property {
    pub const ALL: [Property; 9] = [
        Property::CreationDate,
        Property::DisplayName,
        Property::GetContentLength,
        Property::GetContentType,
        Property::GetEtag,
        Property::GetLastModified,
        Property::ResourceType,
        Property::SupportedLock,
        Property::LockDiscovery,
    ];

    pub fn local_name(self) -> &'static str {
        match self {
            Property::CreationDate => "creationdate",
            Property::DisplayName => "displayname",
            Property::GetContentLength => "getcontentlength",
            Property::GetContentType => "getcontenttype",
            Property::GetEtag => "getetag",
            Property::GetLastModified => "getlastmodified",
            Property::ResourceType => "resourcetype",
            Property::SupportedLock => "supportedlock",
            Property::LockDiscovery => "lockdiscovery",
        }
    }

    fn from_local_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|prop| prop.local_name() == name)
    }

    /// 内容长度与类型只对文件有意义。
    fn applies_to(self, node: &Node) -> bool {
        !(node.is_folder()
            && matches!(self, Property::GetContentLength | Property::GetContentType))
    }
}

/// 每个 response 元素携带的内容。
#[derive(Debug, Clone, PartialEq, Eq)]
enum Selection {
    Values(Vec<Property>),
    Names,
}

impl Selection {
    fn from_request(request: &PropfindRequest) -> Self {
        match request {
            PropfindRequest::AllProp => Selection::Values(Property::ALL.to_vec()),
            PropfindRequest::PropName => Selection::Names,
            PropfindRequest::Props(names) => {
                let mut props = Vec::new();
                for name in names.iter().filter(|name| name.is_dav()) {
                    if let Some(prop) = Property::from_local_name(&name.name)
                        && !props.contains(&prop)
                    {
                        props.push(prop);
                    }
                }
                Selection::Values(props)
            }
        }
    }

    fn wants_locks(&self) -> bool {
        match self {
            Selection::Values(props) => props.contains(&Property::LockDiscovery),
            Selection::Names => false,
        }
    }
}

/// 遍历中的一个节点及其客户端可见路径。
struct Entry {
    path: DavPath,
    node: Node,
    locks: Vec<Lock>,
}

/// 从 `path` 开始按 `depth` 深度优先遍历，父节点先于子节点。
async fn collect_entries(
    adapter: &ResourceAdapter,
    path: &DavPath,
    depth: Depth,
) -> Result<Vec<Entry>, DavError> {
    let root = adapter.stat(path).await?;
    let mut entries = Vec::new();
    let mut stack = vec![(path.clone(), root, 0usize)];
    while let Some((path, node, level)) = stack.pop() {
        let descend = node.is_folder()
            && match depth {
                Depth::Zero => false,
                Depth::One => level == 0,
                Depth::Infinity => true,
            };
        if descend {
            let children = adapter.resolver().list_children(&node).await?;
            for child in children.iter().rev() {
                stack.push((path.join(&child.name), child.clone(), level + 1));
            }
        }
        entries.push(Entry {
            path,
            node,
            locks: Vec::new(),
        });
    }
    Ok(entries)
}

/// 生成 PROPFIND 响应体。
pub async fn propfind(
    adapter: &ResourceAdapter,
    locks: &LockManager,
    path: &DavPath,
    depth: Depth,
    request: &PropfindRequest,
    prefix: &str,
) -> Result<Vec<u8>, DavError> {
    let selection = Selection::from_request(request);
    let mut entries = collect_entries(adapter, path, depth).await?;
    if selection.wants_locks() {
        for entry in &mut entries {
            entry.locks = locks.get_locks_for_path(&entry.path).await;
        }
    }
    debug!(path = %path, depth = ?depth, responses = entries.len(), "propfind walk finished");

    let mut out = new_document()?;
    out.write(XmlEvent::start_element("D:multistatus").ns("D", DAV_NS))?;
    for entry in &entries {
        write_response(&mut out, entry, &selection, prefix)?;
    }
    out.write(XmlEvent::end_element())?;
    Ok(out.into_inner())
}

fn write_response<W: Write>(
    out: &mut EventWriter<W>,
    entry: &Entry,
    selection: &Selection,
    prefix: &str,
) -> Result<(), DavError> {
    out.write(XmlEvent::start_element("D:response"))?;
    text_element(out, "D:href", &entry.path.href(prefix, entry.node.is_folder()))?;
    out.write(XmlEvent::start_element("D:propstat"))?;
    out.write(XmlEvent::start_element("D:prop"))?;
    match selection {
        Selection::Names => {
            for prop in Property::ALL {
                if prop.applies_to(&entry.node) {
                    empty_element(out, &format!("D:{}", prop.local_name()))?;
                }
            }
        }
        Selection::Values(props) => {
            for prop in props {
                if prop.applies_to(&entry.node) {
                    write_property(out, *prop, entry, prefix)?;
                }
            }
        }
    }
    out.write(XmlEvent::end_element())?;
    text_element(out, "D:status", "HTTP/1.1 200 OK")?;
    out.write(XmlEvent::end_element())?;
    out.write(XmlEvent::end_element())?;
    Ok(())
}

fn write_property<W: Write>(
    out: &mut EventWriter<W>,
    prop: Property,
    entry: &Entry,
    prefix: &str,
) -> Result<(), DavError> {
    let node = &entry.node;
    let name = format!("D:{}", prop.local_name());
    match prop {
        Property::CreationDate => text_element(
            out,
            &name,
            &node.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        Property::DisplayName => text_element(out, &name, entry.path.name().unwrap_or_default()),
        Property::GetContentLength => text_element(out, &name, &node.size.to_string()),
        Property::GetContentType => text_element(out, &name, &node.mime_type),
        Property::GetEtag => text_element(out, &name, &etag_for_node(node)),
        Property::GetLastModified => text_element(
            out,
            &name,
            &fmt_http_date(SystemTime::from(node.modified_at)),
        ),
        Property::ResourceType => {
            out.write(XmlEvent::start_element(name.as_str()))?;
            if node.is_folder() {
                empty_element(out, "D:collection")?;
            }
            out.write(XmlEvent::end_element())?;
            Ok(())
        }
        Property::SupportedLock => write_supported_lock(out),
        Property::LockDiscovery => write_lock_discovery(out, &entry.locks, prefix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cache::MetadataCache;
    use crate::dav_xml::PropName;
    use crate::resolver::PathResolver;
    use crate::store::MemoryNodeStore;
    use crate::webdav_lock::{LockDepth, LockRequest, LockScope};

    /// `/`, `/a`, `/a/b`, `/a/b/c.txt`
    async fn four_node_tree() -> ResourceAdapter {
        let store = Arc::new(MemoryNodeStore::new());
        store.seed_file("a/b/c.txt", b"hello").await;
        let cache = Arc::new(MetadataCache::new(Duration::from_secs(30), 0));
        let resolver = Arc::new(PathResolver::new(store, cache, DavPath::root()));
        ResourceAdapter::new(resolver)
    }

    async fn run(adapter: &ResourceAdapter, depth: Depth, request: PropfindRequest) -> String {
        let locks = LockManager::new();
        let body = propfind(adapter, &locks, &DavPath::root(), depth, &request, "")
            .await
            .expect("propfind");
        String::from_utf8(body).expect("utf8")
    }

    fn hrefs(body: &str) -> Vec<String> {
        body.split("<D:href>")
            .skip(1)
            .filter_map(|part| part.split("</D:href>").next())
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn depth_bounds_the_walk() {
        let adapter = four_node_tree().await;
        let zero = run(&adapter, Depth::Zero, PropfindRequest::AllProp).await;
        assert_eq!(hrefs(&zero), vec!["/"]);

        let one = run(&adapter, Depth::One, PropfindRequest::AllProp).await;
        assert_eq!(hrefs(&one), vec!["/", "/a/"]);

        let all = run(&adapter, Depth::Infinity, PropfindRequest::AllProp).await;
        assert_eq!(hrefs(&all), vec!["/", "/a/", "/a/b/", "/a/b/c.txt"]);
    }

    #[tokio::test]
    async fn folders_have_no_content_length() {
        let adapter = four_node_tree().await;
        let body = run(&adapter, Depth::Infinity, PropfindRequest::AllProp).await;
        assert_eq!(body.matches("<D:getcontentlength>").count(), 1);
        assert!(body.contains("<D:getcontentlength>5</D:getcontentlength>"));
        assert_eq!(body.matches("<D:collection").count(), 3);
    }

    #[tokio::test]
    async fn explicit_props_only_and_unknown_omitted() {
        let adapter = four_node_tree().await;
        let request = PropfindRequest::Props(vec![
            PropName {
                namespace: Some(DAV_NS.into()),
                name: "displayname".into(),
            },
            PropName {
                namespace: Some("urn:example".into()),
                name: "color".into(),
            },
        ]);
        let body = run(&adapter, Depth::One, request).await;
        assert!(body.contains("<D:displayname>a</D:displayname>"));
        assert!(!body.contains("getetag"));
        assert!(!body.contains("color"));
    }

    #[tokio::test]
    async fn propname_lists_names_without_values() {
        let adapter = four_node_tree().await;
        let body = run(&adapter, Depth::Zero, PropfindRequest::PropName).await;
        assert!(body.contains("<D:getetag"));
        assert!(!body.contains("<D:getcontentlength"));
        assert!(!body.contains("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn lockdiscovery_reports_covering_locks() {
        let adapter = four_node_tree().await;
        let locks = LockManager::new();
        let lock = locks
            .create_lock(LockRequest {
                path: DavPath::parse("/a").unwrap(),
                owner: None,
                timeout: Duration::from_secs(60),
                scope: LockScope::Exclusive,
                depth: LockDepth::Infinity,
                provisional: false,
            })
            .await
            .expect("lock");
        let request = PropfindRequest::Props(vec![PropName {
            namespace: Some(DAV_NS.into()),
            name: "lockdiscovery".into(),
        }]);
        let body = propfind(
            &adapter,
            &locks,
            &DavPath::parse("/a/b/c.txt").unwrap(),
            Depth::Zero,
            &request,
            "",
        )
        .await
        .expect("propfind");
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains(&lock.token));
    }

    #[tokio::test]
    async fn missing_path_is_not_found() {
        let adapter = four_node_tree().await;
        let locks = LockManager::new();
        let result = propfind(
            &adapter,
            &locks,
            &DavPath::parse("/nope").unwrap(),
            Depth::Zero,
            &PropfindRequest::AllProp,
            "",
        )
        .await;
        assert!(matches!(result, Err(DavError::NotFound(_))));
    }
}
