//! DASH manifest synthesis from a YouTube adaptive-format list.
//!
//! The rendered document is padded with spaces to a fixed size so the file
//! has a known length for range requests before any network round-trip.

use bytes::Bytes;
use serde_json::Value;

use crate::config::DASH_MANIFEST_SIZE;
use crate::error::{Error, Result};
use crate::provider::Range;
use crate::webdav::xml_escape;

/// Split `"video/webm; codecs=\"vp9\""` into essence and codec list.
fn mime_and_codecs(mime_type: &str) -> (&str, &str) {
    match mime_type.split_once(';') {
        Some((essence, rest)) => {
            let codecs = rest
                .trim()
                .strip_prefix("codecs=\"")
                .and_then(|c| c.strip_suffix('"'))
                .unwrap_or("");
            (essence.trim(), codecs)
        }
        None => (mime_type.trim(), ""),
    }
}

/// File extension used for a stream of the given format.
pub fn stream_extension(mime_type: &str) -> &str {
    let (essence, _) = mime_and_codecs(mime_type);
    essence.split_once('/').map(|(_, sub)| sub).unwrap_or("bin")
}

/// Name of the stream file a format is exposed as inside a stream directory.
pub fn stream_file_name(format: &Value) -> Option<String> {
    let itag = format["itag"].as_i64()?;
    let mime = format["mimeType"].as_str()?;
    Some(format!("{itag}.{}", stream_extension(mime)))
}

/// Build the manifest; `base_path` points back at the gateway's per-stream
/// directory so the player fetches actual bytes through the proxy.
pub fn generate_manifest(base_path: &str, adaptive_formats: &[Value]) -> String {
    let duration = adaptive_formats
        .iter()
        .filter_map(|f| f["approxDurationMs"].as_str()?.parse::<u64>().ok())
        .next()
        .map(|ms| format!(" mediaPresentationDuration=\"PT{}.{:03}S\"", ms / 1000, ms % 1000))
        .unwrap_or_default();

    let mut sets = String::new();
    for format in adaptive_formats {
        let Some(mime) = format["mimeType"].as_str() else {
            continue;
        };
        let Some(name) = stream_file_name(format) else {
            continue;
        };
        let (essence, codecs) = mime_and_codecs(mime);
        let itag = format["itag"].as_i64().unwrap_or_default();
        let bandwidth = format["bitrate"].as_u64().unwrap_or_default();

        let mut representation = format!(
            "<Representation id=\"{itag}\" bandwidth=\"{bandwidth}\" codecs=\"{}\" mimeType=\"{}\"",
            xml_escape(codecs),
            xml_escape(essence)
        );
        if let (Some(width), Some(height)) =
            (format["width"].as_u64(), format["height"].as_u64())
        {
            representation.push_str(&format!(" width=\"{width}\" height=\"{height}\""));
        }
        if let Some(rate) = format["audioSampleRate"].as_str() {
            representation.push_str(&format!(" audioSamplingRate=\"{}\"", xml_escape(rate)));
        }
        representation.push_str(&format!(
            "><BaseURL>{}{}</BaseURL></Representation>",
            xml_escape(base_path),
            xml_escape(&name)
        ));

        sets.push_str(&format!(
            "<AdaptationSet mimeType=\"{}\">{representation}</AdaptationSet>",
            xml_escape(essence)
        ));
    }

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\" type=\"static\" \
         profiles=\"urn:mpeg:dash:profile:full:2011\" minBufferTime=\"PT2S\"{duration}>\
         <Period>{sets}</Period></MPD>"
    )
}

/// Pad the manifest to the fixed advertised size and slice the requested
/// range. An oversized rendered manifest is rejected: growing the padding
/// would contradict the size already reported in directory listings.
pub fn render_padded(manifest: String, range: Range) -> Result<Bytes> {
    if manifest.len() as u64 > DASH_MANIFEST_SIZE {
        return Err(Error::parse("rendered DASH manifest exceeds the fixed size"));
    }
    if range.start >= DASH_MANIFEST_SIZE || range.end.is_some_and(|end| end >= DASH_MANIFEST_SIZE) {
        return Err(Error::RangeNotSatisfiable {
            size: Some(DASH_MANIFEST_SIZE),
        });
    }
    let mut padded = manifest.into_bytes();
    padded.resize(DASH_MANIFEST_SIZE as usize, b' ');
    let end = range.end.unwrap_or(DASH_MANIFEST_SIZE - 1) as usize;
    Ok(Bytes::copy_from_slice(&padded[range.start as usize..=end]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn formats() -> Vec<Value> {
        vec![
            json!({
                "itag": 248,
                "mimeType": "video/webm; codecs=\"vp9\"",
                "bitrate": 2_500_000,
                "width": 1920,
                "height": 1080,
                "contentLength": "1000000",
                "approxDurationMs": "63250"
            }),
            json!({
                "itag": 251,
                "mimeType": "audio/webm; codecs=\"opus\"",
                "bitrate": 160_000,
                "audioSampleRate": "48000",
                "contentLength": "400000"
            }),
        ]
    }

    #[test]
    fn manifest_contains_representations_and_base_urls() {
        let manifest = generate_manifest("../streams/My%20Video/", &formats());
        assert!(manifest.contains("mediaPresentationDuration=\"PT63.250S\""));
        assert!(manifest.contains("<Representation id=\"248\" bandwidth=\"2500000\" codecs=\"vp9\" mimeType=\"video/webm\" width=\"1920\" height=\"1080\">"));
        assert!(manifest.contains("audioSamplingRate=\"48000\""));
        assert!(manifest.contains("<BaseURL>../streams/My%20Video/248.webm</BaseURL>"));
        assert!(manifest.contains("<BaseURL>../streams/My%20Video/251.webm</BaseURL>"));
    }

    #[test]
    fn padded_render_has_fixed_size() {
        let manifest = generate_manifest("../streams/x/", &formats());
        let body = render_padded(manifest.clone(), Range::full()).expect("render");
        assert_eq!(body.len() as u64, DASH_MANIFEST_SIZE);
        assert_eq!(body.last(), Some(&b' '));
        assert!(body.starts_with(manifest.as_bytes()));
    }

    #[test]
    fn in_range_slice_is_returned() {
        let manifest = generate_manifest("../streams/x/", &formats());
        let body = render_padded(
            manifest,
            Range {
                start: 0,
                end: Some(15_999),
            },
        )
        .expect("render");
        assert_eq!(body.len(), 16_000);
        assert_eq!(body.last(), Some(&b' '));
    }

    #[test]
    fn out_of_range_request_is_rejected() {
        let manifest = generate_manifest("../streams/x/", &formats());
        let result = render_padded(
            manifest,
            Range {
                start: 20_000,
                end: None,
            },
        );
        assert!(matches!(
            result,
            Err(Error::RangeNotSatisfiable { size: Some(s) }) if s == DASH_MANIFEST_SIZE
        ));
    }

    #[test]
    fn oversized_manifest_is_rejected() {
        let oversized = " ".repeat(DASH_MANIFEST_SIZE as usize + 1);
        assert!(matches!(
            render_padded(oversized, Range::full()),
            Err(Error::Parse(_))
        ));
    }
}
