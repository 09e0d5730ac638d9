//! Room addressing.
//!
//! A room lives at `{host}/connect?roomId={room_id}`. Hosts may be given
//! with a `ws`/`wss` scheme, an `http`/`https` scheme (mapped to the
//! WebSocket equivalent) or no scheme at all (`ws` is assumed).

use url::Url;

/// Where to connect for a given room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomAddress {
    host: Url,
    room_id: String,
}

impl RoomAddress {
    /// Validate a host and room id.
    ///
    /// # Errors
    ///
    /// Returns error if the host cannot be parsed, uses an unsupported
    /// scheme, or the room id is empty.
    pub fn new(host: &str, room_id: impl Into<String>) -> Result<Self, AddressError> {
        let room_id = room_id.into();
        if room_id.trim().is_empty() {
            return Err(AddressError::EmptyRoom);
        }

        Ok(Self {
            host: parse_host(host)?,
            room_id,
        })
    }

    /// The normalized WebSocket host.
    #[must_use]
    pub fn host(&self) -> &Url {
        &self.host
    }

    /// The room identifier.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Full connection URL for the room.
    #[must_use]
    pub fn connect_url(&self) -> Url {
        let mut url = self.host.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/connect"));
        url.query_pairs_mut()
            .clear()
            .append_pair("roomId", &self.room_id);
        url
    }
}

impl std::fmt::Display for RoomAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.connect_url())
    }
}

fn parse_host(input: &str) -> Result<Url, AddressError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AddressError::InvalidHost("host is empty".to_string()));
    }

    let candidate = if input.contains("://") {
        input.to_string()
    } else {
        format!("ws://{input}")
    };

    let mut url =
        Url::parse(&candidate).map_err(|e| AddressError::InvalidHost(format!("{input}: {e}")))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(AddressError::UnsupportedScheme(other.to_string())),
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|()| AddressError::InvalidHost(format!("{input}: cannot use {scheme}")))?;
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(AddressError::InvalidHost(format!("{input}: missing host")));
    }

    Ok(url)
}

/// Errors when building a room address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// Host could not be parsed
    #[error("invalid host: {0}")]
    InvalidHost(String),
    /// Host scheme is not WebSocket or HTTP
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    /// Room id is blank
    #[error("room id is empty")]
    EmptyRoom,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_connect_url() {
        let room = RoomAddress::new("ws://localhost:8787", "abc").unwrap();
        assert_eq!(
            room.connect_url().as_str(),
            "ws://localhost:8787/connect?roomId=abc"
        );
    }

    #[test]
    fn maps_http_schemes() {
        let plain = RoomAddress::new("http://sync.example.com", "r1").unwrap();
        assert_eq!(plain.host().scheme(), "ws");

        let secure = RoomAddress::new("https://sync.example.com/base/", "r1").unwrap();
        assert_eq!(
            secure.connect_url().as_str(),
            "wss://sync.example.com/base/connect?roomId=r1"
        );
    }

    #[test]
    fn bare_host_defaults_to_ws() {
        let room = RoomAddress::new("localhost:9000", "r").unwrap();
        assert_eq!(room.host().scheme(), "ws");
        assert_eq!(room.host().port(), Some(9000));
    }

    #[test]
    fn room_id_is_query_encoded() {
        let room = RoomAddress::new("ws://h", "a b&c").unwrap();
        let pairs: Vec<(String, String)> = room
            .connect_url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs, vec![("roomId".to_string(), "a b&c".to_string())]);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            RoomAddress::new("ws://h", "  "),
            Err(AddressError::EmptyRoom)
        );
        assert!(matches!(
            RoomAddress::new("ftp://h", "r"),
            Err(AddressError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            RoomAddress::new("", "r"),
            Err(AddressError::InvalidHost(_))
        ));
    }
}
