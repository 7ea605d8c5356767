//! Slash-delimited pointers into a replicant's value.
//!
//! A pointer is either empty or `/`-prefixed. Inside a segment `~` is written
//! as `~0` and `/` as `~1`. The root of a value is addressed as `/`; both `/`
//! and the empty pointer decode to an empty segment list.
//!
//! ```text
//!   ["players", "a/b", "~x"]  ◄──►  "/players/a~1b/~0x"
//! ```

/// Pointer to the root of a value.
pub const ROOT: &str = "/";

/// Errors raised while decoding a pointer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PointerError {
    #[error("pointer {0:?} must be empty or start with '/'")]
    MissingLeadingSlash(String),
    #[error("pointer {pointer:?} has an invalid escape sequence at byte {offset}")]
    InvalidEscape { pointer: String, offset: usize },
}

/// Escape a single segment (`~` first, then `/`).
pub fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Un-escape a single segment.
pub fn unescape(segment: &str) -> Result<String, PointerError> {
    unescape_at(segment, segment, 0)
}

fn unescape_at(pointer: &str, segment: &str, base: usize) -> Result<String, PointerError> {
    if !segment.contains('~') {
        return Ok(segment.to_string());
    }
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.char_indices();
    while let Some((i, c)) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some((_, '0')) => out.push('~'),
            Some((_, '1')) => out.push('/'),
            _ => {
                return Err(PointerError::InvalidEscape {
                    pointer: pointer.to_string(),
                    offset: base + i,
                })
            }
        }
    }
    Ok(out)
}

/// Encode a list of segments into a pointer. An empty list encodes as [`ROOT`].
pub fn encode<S: AsRef<str>>(segments: &[S]) -> String {
    if segments.is_empty() {
        return ROOT.to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(&escape(segment.as_ref()));
    }
    out
}

/// Decode a pointer into its un-escaped segments.
pub fn decode(pointer: &str) -> Result<Vec<String>, PointerError> {
    if pointer.is_empty() || pointer == ROOT {
        return Ok(Vec::new());
    }
    let rest = pointer
        .strip_prefix('/')
        .ok_or_else(|| PointerError::MissingLeadingSlash(pointer.to_string()))?;

    let mut offset = 1;
    let mut segments = Vec::new();
    for raw in rest.split('/') {
        segments.push(unescape_at(pointer, raw, offset)?);
        offset += raw.len() + 1;
    }
    Ok(segments)
}

/// Append one (un-escaped) key to an encoded pointer.
pub fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() || parent == ROOT {
        format!("/{}", escape(key))
    } else {
        format!("{parent}/{}", escape(key))
    }
}
