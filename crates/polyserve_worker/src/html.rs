//! HTML base-tag injection for sub-path hosting.
//!
//! Apps are served under `/{app}/`, but their HTML refers to
//! root-relative assets. Inserting `<base href="/{app}/" />` right after
//! `<head>` makes the browser resolve those references under the app
//! prefix. The tag must land before any asset reference, so it goes
//! immediately after the opening head tag.

/// Insert a `<base>` tag after `<head>`. Returns `None` when the
/// document has no head tag (body left untouched by the caller).
pub fn insert_base_tag(body: &[u8], app_name: &str) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(body).ok()?;
    let lower = text.to_ascii_lowercase();

    // Find an exact <head ...> tag; "<header>" must not match.
    let mut search_from = 0;
    let start = loop {
        let idx = lower[search_from..].find("<head")? + search_from;
        match lower.as_bytes().get(idx + 5) {
            Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') => break idx,
            _ => search_from = idx + 5,
        }
    };
    let end = lower[start..].find('>')? + start + 1;

    let tag = format!("<base href=\"/{app_name}/\" />");
    let mut out = String::with_capacity(text.len() + tag.len());
    out.push_str(&text[..end]);
    out.push_str(&tag);
    out.push_str(&text[end..]);
    Some(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserts_after_head() {
        let html = b"<html><head><link href=\"/a.css\"></head></html>";
        let out = insert_base_tag(html, "shop").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "<html><head><base href=\"/shop/\" /><link href=\"/a.css\"></head></html>"
        );
    }

    #[test]
    fn test_head_with_attributes() {
        let html = b"<html><HEAD lang=\"en\"><title>t</title></HEAD></html>";
        let out = insert_base_tag(html, "a").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("<HEAD lang=\"en\"><base href=\"/a/\" />"));
    }

    #[test]
    fn test_no_head_returns_none() {
        assert!(insert_base_tag(b"<html><body></body></html>", "a").is_none());
        assert!(insert_base_tag(&[0xFF, 0xFE], "a").is_none());
    }

    #[test]
    fn test_header_element_does_not_match() {
        assert!(insert_base_tag(b"<html><body><header>x</header></body></html>", "a").is_none());
    }
}
