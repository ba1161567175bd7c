//! The minimal valid empty snapshot blob sent after `FULLRESYNC`, and its raw-frame
//! encoding. This server never persists writes, so this is the only snapshot payload a
//! leader ever produces.

use base64::prelude::*;

use crate::common::CRLF;

const EMPTY_RDB_BASE64_ENCODED: &[u8] = b"UkVESVMwMDEx+glyZWRpcy12ZXIFNy4yLjD6CnJlZGlzLWJpdHPAQPoFY3RpbWXCbQi8ZfoIdXNlZC1tZW3CsMQQAPoIYW9mLWJhc2XAAP/wbjv+wP9aog==";

pub fn get_empty_rdb() -> Vec<u8> {
    base64::prelude::BASE64_STANDARD
        .decode(EMPTY_RDB_BASE64_ENCODED)
        .expect("Not a valid base64 encoded empty RDB file")
}

/// Frame `rdb` the way a `FULLRESYNC` snapshot transfer expects: a bulk-string length
/// header with no trailing CRLF after the payload.
pub fn serialize_rdb(rdb: &[u8]) -> Vec<u8> {
    [b"$", rdb.len().to_string().as_bytes(), CRLF.as_bytes(), rdb].concat()
}
