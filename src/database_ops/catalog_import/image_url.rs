use url::Url;

/// Dropbox share links open a preview page; `dl=1` makes them serve the file itself.
/// Everything else passes through trimmed and otherwise untouched.
pub fn normalize_image_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    let is_dropbox = url
        .host_str()
        .map(|h| h == "dropbox.com" || h.ends_with(".dropbox.com"))
        .unwrap_or(false);
    if !is_dropbox {
        return trimmed.to_string();
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "dl" && k != "raw")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut q = url.query_pairs_mut();
        q.clear();
        for (k, v) in &kept {
            q.append_pair(k, v);
        }
        q.append_pair("dl", "1");
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropbox_preview_links_become_direct_downloads() {
        assert_eq!(
            normalize_image_url("https://www.dropbox.com/s/abc123/bottle.jpg?dl=0"),
            "https://www.dropbox.com/s/abc123/bottle.jpg?dl=1"
        );
        assert_eq!(
            normalize_image_url("https://www.dropbox.com/scl/fi/xyz/bib.png?rlkey=k9&raw=1"),
            "https://www.dropbox.com/scl/fi/xyz/bib.png?rlkey=k9&dl=1"
        );
        assert_eq!(
            normalize_image_url(" https://dropbox.com/s/abc/x.jpg "),
            "https://dropbox.com/s/abc/x.jpg?dl=1"
        );
    }

    #[test]
    fn other_urls_pass_through() {
        assert_eq!(
            normalize_image_url("https://cdn.example.com/a.jpg?w=400"),
            "https://cdn.example.com/a.jpg?w=400"
        );
        assert_eq!(normalize_image_url("not a url"), "not a url");
        assert_eq!(normalize_image_url("   "), "");
    }
}
