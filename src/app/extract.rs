//! URL discovery from sitemap XML and page HTML.
//!
//! Discovery is best-effort: values that do not parse as URLs are dropped rather
//! than reported, since they say more about the scanner than about the site.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use super::types::ExtractorKind;

const SKIPPED_SCHEMES: [&str; 4] = ["mailto:", "tel:", "javascript:", "data:"];

// Attribute names must follow whitespace or `/`, so `data-src` and friends
// used by lazy loaders are not treated as references.
static LINK_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|[\s/])(?:src|href)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'<>`=]+))"#)
        .expect("link attribute pattern")
});

static SRCSET_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|[\s/])srcset\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("srcset pattern")
});

/// Finds audit targets in fetched documents.
pub trait LinkExtractor: Send + Sync {
    /// Page URLs listed by a sitemap, re-rooted on `base` and deduplicated by path+query.
    fn sitemap_urls(&self, xml: &str, base: &Url) -> Vec<Url> {
        extract_sitemap_urls(xml, base)
    }

    /// Fetchable URLs referenced by `html`, resolved against `page` and deduplicated.
    fn asset_urls(&self, html: &str, page: &Url) -> Vec<Url>;
}

pub fn extractor_for(kind: ExtractorKind) -> Box<dyn LinkExtractor> {
    match kind {
        ExtractorKind::Scan => Box::new(ScanExtractor),
        ExtractorKind::Dom => Box::new(DomExtractor),
    }
}

/// Attribute scanning over raw markup. Tolerates broken HTML.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanExtractor;

impl LinkExtractor for ScanExtractor {
    fn asset_urls(&self, html: &str, page: &Url) -> Vec<Url> {
        let mut raw = Vec::new();
        for caps in LINK_ATTR.captures_iter(html) {
            if let Some(value) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) {
                raw.push(decode_entities(value.as_str()));
            }
        }
        for caps in SRCSET_ATTR.captures_iter(html) {
            if let Some(value) = caps.get(1).or_else(|| caps.get(2)) {
                let srcset = decode_entities(value.as_str());
                raw.extend(srcset_candidates(&srcset).into_iter().map(str::to_string));
            }
        }
        resolve_all(raw, page)
    }
}

/// Parses the page into a DOM and reads `src`, `href` and `srcset` attributes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DomExtractor;

impl LinkExtractor for DomExtractor {
    fn asset_urls(&self, html: &str, page: &Url) -> Vec<Url> {
        let doc = Html::parse_document(html);
        let Ok(selector) = Selector::parse("[src], [href], [srcset]") else {
            return Vec::new();
        };

        let mut raw = Vec::new();
        for el in doc.select(&selector) {
            let attrs = el.value();
            raw.extend(attrs.attr("src"));
            raw.extend(attrs.attr("href"));
            if let Some(srcset) = attrs.attr("srcset") {
                raw.extend(srcset_candidates(srcset));
            }
        }
        resolve_all(raw, page)
    }
}

pub fn extract_sitemap_urls(xml: &str, base: &Url) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for loc in extract_xml_loc_values(xml) {
        let Ok(listed) = Url::parse(&loc) else {
            continue;
        };
        let target = path_and_query(&listed);
        if !seen.insert(target.clone()) {
            continue;
        }
        if let Ok(url) = base.join(&target) {
            out.push(url);
        }
    }
    out
}

fn extract_xml_loc_values(xml: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0usize;
    while let Some(open_idx) = xml[start..].find("<loc>") {
        let open = start + open_idx + 5;
        let Some(close_rel) = xml[open..].find("</loc>") else {
            break;
        };
        let close = open + close_rel;
        let value = unwrap_cdata(xml[open..close].trim());
        if !value.is_empty() {
            out.push(decode_entities(value));
        }
        start = close + 6;
    }
    out
}

fn unwrap_cdata(value: &str) -> &str {
    value
        .strip_prefix("<![CDATA[")
        .and_then(|rest| rest.strip_suffix("]]>"))
        .map(str::trim)
        .unwrap_or(value)
}

/// Decode the predefined XML entities and numeric character references.
/// Unknown references are left as written.
fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];
        let decoded = tail
            .find(';')
            .filter(|end| *end <= 10)
            .and_then(|end| entity_char(&tail[1..end]).map(|ch| (ch, end)));
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn entity_char(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let number = name.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// URL portions of a `srcset` list, descriptors dropped.
///
/// A candidate URL runs to the next whitespace, so commas inside it (as in
/// `data:` URIs) stay part of the URL; the descriptor runs to the next comma.
fn srcset_candidates(srcset: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = srcset;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if rest.is_empty() {
            break;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (token, tail) = rest.split_at(end);
        let url = token.trim_end_matches(',');
        if !url.is_empty() {
            out.push(url);
        }
        rest = if token.ends_with(',') {
            tail
        } else {
            tail.find(',').map(|i| &tail[i + 1..]).unwrap_or("")
        };
    }
    out
}

fn resolve_all<S: AsRef<str>>(raw: impl IntoIterator<Item = S>, page: &Url) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in raw {
        let Some(url) = resolve_reference(page, value.as_ref()) else {
            continue;
        };
        if seen.insert(url.as_str().to_string()) {
            out.push(url);
        }
    }
    out
}

fn resolve_reference(page: &Url, value: &str) -> Option<Url> {
    let value = value.trim();
    if value.is_empty() || value.starts_with('#') {
        return None;
    }
    let lowered = value.to_ascii_lowercase();
    if SKIPPED_SCHEMES.iter().any(|scheme| lowered.starts_with(scheme)) {
        return None;
    }

    let mut url = page.join(value).ok()?;
    url.set_fragment(None);
    Some(url)
}

/// Same scheme, host and port.
pub fn is_same_origin(candidate: &Url, base: &Url) -> bool {
    candidate.origin() == base.origin()
}

/// Path plus `?query`, used to report URLs without their scheme and host.
pub fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}
