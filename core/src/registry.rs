// SPDX-License-Identifier: MIT

//! The command decoder registry: a build-once, read-many map from
//! `commandCode` to the callback that turns a raw parameter area into a
//! typed response.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TpmResult;
use crate::pool::Pool;
use crate::types::Response;
use crate::wire::Reader;

/// Anything a decoder can return, boxed so the registry can hold a single
/// map regardless of each command's concrete response type.
pub type DecodedResponse = Box<dyn std::any::Any + Send>;

/// A decoder callback: given the raw parameter-area bytes and the pool to
/// rent sensitive output buffers from, produce a typed response.
pub type Decoder = Arc<dyn Fn(&mut Reader, &Pool) -> TpmResult<DecodedResponse> + Send + Sync>;

/// A frozen, `Arc`-shared mapping from `commandCode` to [`Decoder`].
///
/// Registration happens once at startup (`Registry::builder()` ...
/// `.build()`); after that the registry is read-only and needs no locking,
/// matching the concurrency model's "build-once, read-many" contract.
pub struct Registry {
    decoders: HashMap<u32, Decoder>,
}

impl Registry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    #[must_use]
    pub fn get(&self, command_code: u32) -> Option<&Decoder> {
        self.decoders.get(&command_code)
    }

    /// Decodes a raw response's parameter area using the registered
    /// decoder for `command_code`, downcasting to `T`.
    ///
    /// # Errors
    ///
    /// Returns `None` if no decoder is registered, or if the decoder's
    /// output type does not match `T` (a programmer error: decoders and
    /// their call sites must agree on the expected type).
    pub fn decode<T: 'static>(&self, command_code: u32, reader: &mut Reader, pool: &Pool) -> Option<TpmResult<T>> {
        let decoder = self.get(command_code)?;
        Some(decoder(reader, pool).map(|boxed| {
            *boxed
                .downcast::<T>()
                .expect("decoder registered under the wrong response type")
        }))
    }
}

/// Builder for [`Registry`]. Built-in decoders are added by
/// [`crate::decoders::register_builtin`]; callers add their own on top.
#[derive(Default)]
pub struct RegistryBuilder {
    decoders: HashMap<u32, Decoder>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn register<T, F>(mut self, command_code: u32, decode: F) -> Self
    where
        T: Send + 'static,
        F: Fn(&mut Reader, &Pool) -> TpmResult<T> + Send + Sync + 'static,
    {
        let decoder: Decoder = Arc::new(move |reader, pool| {
            decode(reader, pool).map(|value| Box::new(value) as DecodedResponse)
        });
        self.decoders.insert(command_code, decoder);
        self
    }

    #[must_use]
    pub fn build(self) -> Registry {
        Registry { decoders: self.decoders }
    }
}

/// A decoded response's header plus the registry's typed decode of its
/// parameter area — returned by the executor once a command succeeds.
pub struct TypedResponse<T> {
    pub header: Response,
    pub value: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_decoder_round_trips() {
        let registry = Registry::builder()
            .register(0x17B, |reader, _pool| reader.read_u16(0x17B).map(u32::from))
            .build();

        let bytes = [0x00u8, 0x10];
        let mut reader = Reader::new(&bytes);
        let pool = Pool::new();
        let result: TpmResult<u32> = registry.decode(0x17B, &mut reader, &pool).unwrap();
        assert_eq!(result.unwrap(), 0x10);
    }

    #[test]
    fn unregistered_command_returns_none() {
        let registry = Registry::builder().build();
        let bytes = [];
        let mut reader = Reader::new(&bytes);
        let pool = Pool::new();
        assert!(registry.decode::<u32>(0x999, &mut reader, &pool).is_none());
    }
}
