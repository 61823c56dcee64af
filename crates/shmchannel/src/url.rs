//! `shm://channel/object` addressing.

/// URL scheme of this transport.
pub const SCHEME: &str = "shm";

const PREFIX: &str = "shm://";

/// Split a channel URL into its channel name and object path.
///
/// Returns `None` for URLs of other transports. The scheme is matched
/// case-insensitively and the object path is passed through untouched.
pub fn parse(url: &str) -> Option<(String, Option<String>)> {
    let scheme = url.get(..PREFIX.len())?;
    if !scheme.eq_ignore_ascii_case(PREFIX) {
        return None;
    }
    let rest = &url[PREFIX.len()..];
    Some(match rest.split_once('/') {
        Some((channel, object)) => (channel.to_owned(), Some(object.to_owned())),
        None => (rest.to_owned(), None),
    })
}

/// URL of a channel itself.
pub fn channel_uri(channel: &str) -> String {
    format!("{PREFIX}{channel}")
}

/// URL of an object served by a channel.
pub fn object_url(channel: &str, object: &str) -> String {
    format!("{PREFIX}{channel}/{object}")
}
