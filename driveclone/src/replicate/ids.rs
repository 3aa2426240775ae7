use url::Url;

/// Drive ids are url-safe base64-ish tokens; anything shorter or with other
/// characters is treated as a link or garbage.
pub fn is_drive_id(value: &str) -> bool {
    (10..=100).contains(&value.len())
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Pulls a file or folder id out of a bare id or a share link such as
/// `https://drive.google.com/drive/folders/<id>`, `.../file/d/<id>/view`
/// or `...open?id=<id>`. The scheme may be omitted.
pub fn extract_drive_id(text: &str) -> Option<String> {
    let cleaned = text.replace('\\', "");
    let candidate = cleaned.split_whitespace().next()?;
    if is_drive_id(candidate) {
        return Some(candidate.to_string());
    }

    let url = if candidate.starts_with("http://") || candidate.starts_with("https://") {
        Url::parse(candidate).ok()?
    } else {
        Url::parse(&format!("https://{candidate}")).ok()?
    };

    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let from_path = if let Some(pos) = segments.iter().position(|s| *s == "folders") {
        segments.get(pos + 1).copied()
    } else if let Some(pos) = segments.windows(2).position(|pair| pair == ["file", "d"]) {
        segments.get(pos + 2).copied()
    } else {
        None
    };

    from_path
        .map(str::to_string)
        .or_else(|| {
            url.query_pairs()
                .find(|(key, _)| key == "id")
                .map(|(_, value)| value.into_owned())
        })
        .filter(|id| is_drive_id(id))
}
