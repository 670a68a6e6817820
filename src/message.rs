//! The message contract.
//!
//! The multiplexer treats messages as opaque: it only needs them to encode to
//! bytes and decode from bytes. Any serde type with a `Default` is a message,
//! encoded as JSON.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

use crate::types::Result;

/// A structured message carried by calls and streams.
pub trait Message: fmt::Debug + Send + Sync {
    /// Reset to the zero value.
    fn reset(&mut self);

    /// Encode to bytes.
    fn marshal(&self) -> Result<Vec<u8>>;

    /// Decode from bytes, replacing the current value.
    fn unmarshal(&mut self, buf: &[u8]) -> Result<()>;

    /// Debug rendering for logs.
    fn describe(&self) -> String {
        format!("{:?}", self)
    }
}

impl<T> Message for T
where
    T: Serialize + DeserializeOwned + Default + fmt::Debug + Send + Sync,
{
    fn reset(&mut self) {
        *self = T::default();
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn unmarshal(&mut self, buf: &[u8]) -> Result<()> {
        *self = serde_json::from_slice(buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorClass;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        data: String,
    }

    #[test]
    fn serde_types_are_messages() {
        let msg = Greeting {
            data: "hi".to_string(),
        };
        let bytes = msg.marshal().unwrap();

        let mut out = Greeting::default();
        out.unmarshal(&bytes).unwrap();
        assert_eq!(out, msg);

        out.reset();
        assert_eq!(out, Greeting::default());
        assert!(msg.describe().contains("hi"));
    }

    #[test]
    fn decode_failure_is_internal() {
        let mut out = Greeting::default();
        let err = out.unmarshal(b"[1, 2").unwrap_err();
        assert!(err.is(ErrorClass::Internal));
    }
}
