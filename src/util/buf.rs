use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// Reading counterpart to [BufMutExt]. Fixed-width numbers are in network byte order, strings and
///  byte sequences are prefixed with their length as a varint.
///
/// NB: The fixed-width reads call [TryGetFixedSupport] explicitly because newer versions of `bytes`
///  have `Buf::try_get_*` methods with the same names
pub trait BufExt: Buf + Sized {
    fn checked_get_u8(&mut self) -> anyhow::Result<u8> {
        Ok(TryGetFixedSupport::try_get_u8(self)?)
    }

    fn checked_get_u16(&mut self) -> anyhow::Result<u16> {
        Ok(TryGetFixedSupport::try_get_u16(self)?)
    }

    fn checked_get_i32(&mut self) -> anyhow::Result<i32> {
        Ok(TryGetFixedSupport::try_get_i32(self)?)
    }

    fn checked_get_i64(&mut self) -> anyhow::Result<i64> {
        Ok(TryGetFixedSupport::try_get_i64(self)?)
    }

    fn checked_get_len(&mut self) -> anyhow::Result<usize> {
        Ok(self.try_get_usize_varint()?)
    }

    fn checked_get_bytes(&mut self) -> anyhow::Result<Bytes> {
        let len = self.checked_get_len()?;
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow: expected {} bytes, {} remaining", len, self.remaining()));
        }
        Ok(self.copy_to_bytes(len))
    }

    fn checked_get_string(&mut self) -> anyhow::Result<String> {
        let raw = self.checked_get_bytes()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

pub trait BufMutExt: BufMut + Sized {
    fn put_len(&mut self, len: usize) {
        self.put_usize_varint(len);
    }

    fn put_len_prefixed(&mut self, data: &[u8]) {
        self.put_len(data.len());
        self.put_slice(data);
    }

    fn put_string(&mut self, s: &str) {
        self.put_len_prefixed(s.as_bytes());
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
