use hex;
use crate::encoding::{DataCodec, EncodingError};

/// Hexadecimal encoding/decoding implementation
pub struct HexCodec;

impl HexCodec {
    /// Create a new Hex codec instance
    pub fn new() -> Self {
        Self
    }
}

impl Default for HexCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl DataCodec for HexCodec {
    fn encode(&self, data: &[u8]) -> Result<String, EncodingError> {
        Ok(hex::encode(data))
    }

    fn decode(&self, encoded: &str) -> Result<Vec<u8>, EncodingError> {
        let trimmed = encoded.trim();
        hex::decode(trimmed)
            .map_err(|e| EncodingError::DecodingFailed(format!("Hex decode error: {}", e)))
    }

    fn can_decode(&self, data: &str) -> bool {
        let trimmed = data.trim();
        
        // Empty string is valid hex
        if trimmed.is_empty() {
            return true;
        }
        
        // Check length (must be even)
        if trimmed.len() % 2 != 0 {
            return false;
        }
        
        // Check for valid hex characters (case insensitive)
        let valid_chars = trimmed.chars().all(|c| c.is_ascii_hexdigit());
        
        if !valid_chars {
            return false;
        }
        
        // Try to decode to verify it's valid hex
        hex::decode(trimmed).is_ok()
    }

    fn format_name(&self) -> &'static str {
        "hex"
    }
}
