// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! RocksDB persistence for the header chain.
//!
//! Keys: `canonical[height] -> hash`, `headers[height ++ hash] -> Header`,
//! `heights[hash] -> height`, and the `head_header_hash` pointer in the
//! default column family.

use std::{io, path::Path, sync::Arc};

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, WriteOptions, DB};

use crate::{
    crypto::{BlockHash, HASH_SIZE},
    types::{Header, Height},
};

const CF_HEADERS: &str = "headers";
const CF_CANONICAL: &str = "canonical";
const CF_HEIGHTS: &str = "heights";

const HEAD_HEADER_KEY: &[u8] = b"head_header_hash";

fn other_err(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

fn header_key(hash: BlockHash, height: Height) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + HASH_SIZE);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(hash.as_ref());
    key
}

pub struct HeaderStore {
    db: Arc<DB>,
    write_opts: WriteOptions,
}

impl HeaderStore {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.optimize_for_point_lookup(64);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_HEADERS, Options::default()),
            ColumnFamilyDescriptor::new(CF_CANONICAL, Options::default()),
            ColumnFamilyDescriptor::new(CF_HEIGHTS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors).map_err(other_err)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(false);

        Ok(Self {
            db: Arc::new(db),
            write_opts,
        })
    }

    fn cf(&self, name: &str) -> io::Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| other_err("Column family not found"))
    }

    /// Stores a header together with its hash -> height mapping.
    pub fn write_header(&self, header: &Header) -> io::Result<()> {
        let hash = header.hash();
        let value = bincode::serialize(header).map_err(other_err)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_HEADERS)?, header_key(hash, header.height), value);
        batch.put_cf(
            self.cf(CF_HEIGHTS)?,
            hash.as_ref(),
            header.height.to_be_bytes(),
        );
        self.db.write_opt(batch, &self.write_opts).map_err(other_err)
    }

    pub fn read_header(&self, hash: BlockHash, height: Height) -> io::Result<Option<Header>> {
        match self
            .db
            .get_cf(self.cf(CF_HEADERS)?, header_key(hash, height))
            .map_err(other_err)?
        {
            Some(value) => bincode::deserialize(&value).map(Some).map_err(other_err),
            None => Ok(None),
        }
    }

    pub fn write_canonical_hash(&self, height: Height, hash: BlockHash) -> io::Result<()> {
        self.db
            .put_cf_opt(
                self.cf(CF_CANONICAL)?,
                height.to_be_bytes(),
                hash.as_ref(),
                &self.write_opts,
            )
            .map_err(other_err)
    }

    pub fn read_canonical_hash(&self, height: Height) -> io::Result<Option<BlockHash>> {
        match self
            .db
            .get_cf(self.cf(CF_CANONICAL)?, height.to_be_bytes())
            .map_err(other_err)?
        {
            Some(value) => Ok(Some(decode_hash(&value)?)),
            None => Ok(None),
        }
    }

    pub fn read_header_height(&self, hash: BlockHash) -> io::Result<Option<Height>> {
        match self
            .db
            .get_cf(self.cf(CF_HEIGHTS)?, hash.as_ref())
            .map_err(other_err)?
        {
            Some(value) => {
                let bytes: [u8; 8] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| other_err("Invalid height encoding"))?;
                Ok(Some(Height::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub fn write_head_header_hash(&self, hash: BlockHash) -> io::Result<()> {
        self.db
            .put_opt(HEAD_HEADER_KEY, hash.as_ref(), &self.write_opts)
            .map_err(other_err)
    }

    pub fn read_head_header_hash(&self) -> io::Result<Option<BlockHash>> {
        match self.db.get(HEAD_HEADER_KEY).map_err(other_err)? {
            Some(value) => Ok(Some(decode_hash(&value)?)),
            None => Ok(None),
        }
    }

    /// Queues deletion of a header and its hash -> height mapping.
    pub fn delete_header(
        &self,
        batch: &mut WriteBatch,
        hash: BlockHash,
        height: Height,
    ) -> io::Result<()> {
        batch.delete_cf(self.cf(CF_HEADERS)?, header_key(hash, height));
        batch.delete_cf(self.cf(CF_HEIGHTS)?, hash.as_ref());
        Ok(())
    }

    pub fn delete_canonical_hash(&self, batch: &mut WriteBatch, height: Height) -> io::Result<()> {
        batch.delete_cf(self.cf(CF_CANONICAL)?, height.to_be_bytes());
        Ok(())
    }

    pub fn commit_batch(&self, batch: WriteBatch) -> io::Result<()> {
        self.db.write_opt(batch, &self.write_opts).map_err(other_err)
    }
}

fn decode_hash(value: &[u8]) -> io::Result<BlockHash> {
    let bytes: [u8; HASH_SIZE] = value
        .try_into()
        .map_err(|_| other_err("Invalid hash encoding"))?;
    Ok(BlockHash::new(bytes))
}
