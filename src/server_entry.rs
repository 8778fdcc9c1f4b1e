//! Relay server entry and its wire encoding
//!
//! An encoded entry is the hex form of a UTF-8 string made of four legacy
//! space-delimited fields (address, web port, web secret, certificate)
//! followed by a JSON object carrying the full record.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::ServerEntryError;

/// Number of space-delimited fields preceding the JSON body
const LEGACY_FIELD_COUNT: usize = 4;

/// One candidate relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    /// Original wire form, kept for persistence
    #[serde(skip)]
    pub encoded_entry: String,
    pub ip_address: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub web_server_port: u16,
    pub web_server_secret: String,
    /// Base64 DER certificate used for pinning
    pub web_server_certificate: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub ssh_port: u16,
    pub ssh_username: String,
    pub ssh_password: String,
    pub ssh_host_key: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub ssh_obfuscated_port: u16,
    pub ssh_obfuscated_key: String,
}

impl ServerEntry {
    /// Decode a hex wire entry.
    pub fn decode(encoded: &str) -> Result<Self, ServerEntryError> {
        let encoded = encoded.trim();
        let bytes = hex::decode(encoded)?;
        let text = String::from_utf8(bytes)?;

        let body = &text[skip_legacy_fields(&text)..];
        let mut entry: ServerEntry = serde_json::from_str(body)?;
        entry.encoded_entry = encoded.to_string();

        debug!("decoded server entry {}", entry.ip_address);
        Ok(entry)
    }

    /// Build the wire form from the record fields.
    pub fn encode(&self) -> String {
        let body = json!({
            "ipAddress": self.ip_address,
            "webServerPort": self.web_server_port,
            "webServerSecret": self.web_server_secret,
            "webServerCertificate": self.web_server_certificate,
            "sshPort": self.ssh_port,
            "sshUsername": self.ssh_username,
            "sshPassword": self.ssh_password,
            "sshHostKey": self.ssh_host_key,
            "sshObfuscatedPort": self.ssh_obfuscated_port,
            "sshObfuscatedKey": self.ssh_obfuscated_key,
        });

        let text = format!(
            "{} {} {} {} {}",
            self.ip_address,
            self.web_server_port,
            self.web_server_secret,
            self.web_server_certificate,
            body
        );
        hex::encode(text.as_bytes())
    }

    /// Port used for reachability probing, or `None` when the entry has none.
    pub fn preferred_reachability_test_port(&self) -> Option<u16> {
        [self.ssh_obfuscated_port, self.ssh_port, self.web_server_port]
            .into_iter()
            .find(|port| *port != 0)
    }
}

/// Byte offset of the JSON body. A missing delimiter restarts the scan
/// from the beginning, so entries without the legacy header parse as-is.
fn skip_legacy_fields(text: &str) -> usize {
    let mut index = 0;
    for _ in 0..LEGACY_FIELD_COUNT {
        index = match text[index..].find(' ') {
            Some(pos) => index + pos + 1,
            None => 0,
        };
    }
    index
}

/// Ports show up both as JSON numbers and numeric strings.
fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(n) => Ok(n),
        Port::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Test fixture with every field derived from the address.
    pub(crate) fn sample_entry(ip: &str) -> ServerEntry {
        let mut entry = ServerEntry {
            encoded_entry: String::new(),
            ip_address: ip.to_string(),
            web_server_port: 8443,
            web_server_secret: format!("secret-{}", ip),
            web_server_certificate: "Y2VydA==".to_string(),
            ssh_port: 22,
            ssh_username: "user".to_string(),
            ssh_password: "pass".to_string(),
            ssh_host_key: "aG9zdGtleQ==".to_string(),
            ssh_obfuscated_port: 995,
            ssh_obfuscated_key: "obfs".to_string(),
        };
        entry.encoded_entry = entry.encode();
        entry
    }

    #[test]
    fn test_decode_with_legacy_header() {
        let original = sample_entry("10.0.0.1");
        let decoded = ServerEntry::decode(&original.encoded_entry).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.ssh_obfuscated_port, 995);
    }

    #[test]
    fn test_decode_without_legacy_header() {
        let body = concat!(
            r#"{"ipAddress":"1.2.3.4","webServerPort":"443","webServerSecret":"s","#,
            r#""webServerCertificate":"c","sshPort":22,"sshUsername":"u","sshPassword":"p","#,
            r#""sshHostKey":"k","sshObfuscatedPort":"53","sshObfuscatedKey":"o"}"#
        );
        let encoded = hex::encode(body);
        let decoded = ServerEntry::decode(&encoded).unwrap();
        assert_eq!(decoded.ip_address, "1.2.3.4");
        assert_eq!(decoded.web_server_port, 443);
        assert_eq!(decoded.ssh_obfuscated_port, 53);
        assert_eq!(decoded.encoded_entry, encoded);
    }

    #[test]
    fn test_decode_rejects_missing_field() {
        let encoded = hex::encode(r#"a b c d {"ipAddress":"1.2.3.4"}"#);
        assert!(matches!(
            ServerEntry::decode(&encoded),
            Err(ServerEntryError::Json(_))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_hex() {
        assert!(matches!(
            ServerEntry::decode("zz"),
            Err(ServerEntryError::Hex(_))
        ));
    }

    #[test]
    fn test_reachability_port_fallback() {
        let mut entry = sample_entry("10.0.0.2");
        assert_eq!(entry.preferred_reachability_test_port(), Some(995));
        entry.ssh_obfuscated_port = 0;
        assert_eq!(entry.preferred_reachability_test_port(), Some(22));
        entry.ssh_port = 0;
        entry.web_server_port = 0;
        assert_eq!(entry.preferred_reachability_test_port(), None);
    }
}
