//! WebDAV multi-status generation for PROPFIND.

use chrono::{DateTime, Utc};

/// Properties of one resource in a multi-status response.
pub struct ElementData {
    pub path: String,
    pub name: String,
    pub is_directory: bool,
    pub size: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub mime_type: Option<String>,
}

/// Escape text for XML content and attribute positions.
pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// One `<d:response>` element.
pub fn element(data: &ElementData) -> String {
    let mut props = String::new();
    props.push_str(&format!(
        "<d:displayname>{}</d:displayname>",
        xml_escape(&data.name)
    ));
    if data.is_directory {
        props.push_str("<d:resourcetype><d:collection/></d:resourcetype>");
    } else {
        props.push_str("<d:resourcetype/>");
        if let Some(size) = data.size {
            props.push_str(&format!(
                "<d:getcontentlength>{size}</d:getcontentlength>"
            ));
        }
        if let Some(mime) = &data.mime_type {
            props.push_str(&format!(
                "<d:getcontenttype>{}</d:getcontenttype>",
                xml_escape(mime)
            ));
        }
    }
    if let Some(timestamp) = data.timestamp {
        props.push_str(&format!(
            "<d:getlastmodified>{}</d:getlastmodified>",
            timestamp.format("%a, %d %b %Y %H:%M:%S GMT")
        ));
    }
    format!(
        "<d:response><d:href>{}</d:href><d:propstat><d:prop>{props}</d:prop>\
         <d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>",
        xml_escape(&data.path)
    )
}

/// Wrap responses into one `207 Multi-Status` document body.
pub fn multi_status(responses: &[String]) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <d:multistatus xmlns:d=\"DAV:\">{}</d:multistatus>",
        responses.concat()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup() {
        assert_eq!(xml_escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }

    #[test]
    fn directory_element_has_collection_type() {
        let rendered = element(&ElementData {
            path: "/google%2Falice/".into(),
            name: "google/alice".into(),
            is_directory: true,
            size: None,
            timestamp: None,
            mime_type: None,
        });
        assert!(rendered.contains("<d:collection/>"));
        assert!(!rendered.contains("getcontentlength"));
    }

    #[test]
    fn file_element_reports_size_and_type() {
        let rendered = element(&ElementData {
            path: "/x/video.mp4".into(),
            name: "video.mp4".into(),
            is_directory: false,
            size: Some(1234),
            timestamp: None,
            mime_type: Some("video/mp4".into()),
        });
        assert!(rendered.contains("<d:getcontentlength>1234</d:getcontentlength>"));
        assert!(rendered.contains("<d:getcontenttype>video/mp4</d:getcontenttype>"));
    }

    #[test]
    fn multi_status_wraps_responses() {
        let body = multi_status(&["<d:response/>".to_string()]);
        assert!(body.starts_with("<?xml"));
        assert!(body.contains("<d:multistatus xmlns:d=\"DAV:\"><d:response/></d:multistatus>"));
    }
}
