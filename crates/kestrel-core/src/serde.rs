// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{fmt, marker::PhantomData};

use serde::de;

pub trait ByteRepr: Sized {
    fn try_copy_from_slice<E: de::Error>(v: &[u8]) -> Result<Self, E>;
}

pub struct BytesVisitor<T>(PhantomData<T>);

impl<T> BytesVisitor<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for BytesVisitor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'de, T: ByteRepr> de::Visitor<'de> for BytesVisitor<T> {
    type Value = T;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a byte array")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        T::try_copy_from_slice(v)
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or_default());
        while let Some(byte) = seq.next_element()? {
            bytes.push(byte);
        }
        T::try_copy_from_slice(&bytes)
    }
}
