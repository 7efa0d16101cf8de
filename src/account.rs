//! Packed account value codec used by the accounts domain.
//!
//! Layout, all fields big-endian with zero-valued fields encoded as a zero
//! length:
//!
//! ```text
//! [nonceLen u8][nonce][balanceLen u8][balance][hashLen u8][hash][incLen u8][incarnation]
//! ```
//!
//! `hashLen` is 0 or 32; the balance is at most 32 bytes unsigned.

use primitive_types::U256;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("malformed account encoding")]
    Malformed,
    #[error("code hash length must be 0 or 32, got {0}")]
    BadHashLength(usize),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub code_hash: Option<[u8; 32]>,
    pub incarnation: u64,
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    if v == 0 {
        out.push(0);
        return;
    }
    let len = (64 - v.leading_zeros()).div_ceil(8) as usize;
    out.push(len as u8);
    out.extend_from_slice(&v.to_be_bytes()[8 - len..]);
}

impl Account {
    pub fn new(nonce: u64, balance: U256, code_hash: Option<[u8; 32]>, incarnation: u64) -> Self {
        Self {
            nonce,
            balance,
            code_hash,
            incarnation,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 8 + 32 + 32 + 8);
        push_u64(&mut out, self.nonce);

        if self.balance.is_zero() {
            out.push(0);
        } else {
            let mut buf = [0u8; 32];
            self.balance.to_big_endian(&mut buf);
            let skip = buf.iter().take_while(|&&b| b == 0).count();
            out.push((32 - skip) as u8);
            out.extend_from_slice(&buf[skip..]);
        }

        match &self.code_hash {
            None => out.push(0),
            Some(hash) => {
                out.push(32);
                out.extend_from_slice(hash);
            }
        }

        push_u64(&mut out, self.incarnation);
        out
    }

    pub fn decode(enc: &[u8]) -> Result<Self, Error> {
        if enc.is_empty() {
            return Ok(Self::default());
        }
        let mut fields = FieldReader { enc, at: 0 };

        let nonce_bytes = fields.next()?;
        if nonce_bytes.len() > 8 {
            return Err(Error::Malformed);
        }
        let nonce = be_u64(nonce_bytes);

        let balance_bytes = fields.next()?;
        if balance_bytes.len() > 32 {
            return Err(Error::Malformed);
        }
        let balance = U256::from_big_endian(balance_bytes);

        let hash_bytes = fields.next()?;
        let code_hash = match hash_bytes.len() {
            0 => None,
            32 => Some(hash_bytes.try_into().expect("length checked")),
            n => return Err(Error::BadHashLength(n)),
        };

        let inc_bytes = fields.next()?;
        if inc_bytes.len() > 8 {
            return Err(Error::Malformed);
        }
        let incarnation = be_u64(inc_bytes);

        Ok(Self {
            nonce,
            balance,
            code_hash,
            incarnation,
        })
    }
}

struct FieldReader<'a> {
    enc: &'a [u8],
    at: usize,
}

impl<'a> FieldReader<'a> {
    fn next(&mut self) -> Result<&'a [u8], Error> {
        let len = *self.enc.get(self.at).ok_or(Error::Malformed)? as usize;
        self.at += 1;
        let field = self
            .enc
            .get(self.at..self.at + len)
            .ok_or(Error::Malformed)?;
        self.at += len;
        Ok(field)
    }
}

fn be_u64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_account_is_four_zero_lengths() {
        let enc = Account::default().encode();
        assert_eq!(enc, vec![0, 0, 0, 0]);
        assert_eq!(Account::decode(&enc).unwrap(), Account::default());
    }

    #[test]
    fn empty_encoding_decodes_to_default() {
        assert_eq!(Account::decode(&[]).unwrap(), Account::default());
    }

    #[test]
    fn decode_recovers_code_hash() {
        let hash = [0x5Au8; 32];
        let acc = Account::new(1, U256::from(10u64), Some(hash), 0);
        let decoded = Account::decode(&acc.encode()).unwrap();
        assert_eq!(decoded.code_hash, Some(hash));
        assert_eq!(decoded, acc);
    }

    #[test]
    fn rejects_bad_hash_length() {
        // nonce=0, balance=0, hashLen=5 with 5 bytes, inc=0
        let enc = [0u8, 0, 5, 1, 2, 3, 4, 5, 0];
        assert_eq!(Account::decode(&enc), Err(Error::BadHashLength(5)));
    }

    #[test]
    fn rejects_truncation() {
        let acc = Account::new(7, U256::from(1u64) << 200, None, 3);
        let enc = acc.encode();
        for cut in 1..enc.len() {
            assert!(Account::decode(&enc[..cut]).is_err(), "cut at {cut}");
        }
    }

    proptest! {
        #[test]
        fn encode_decode_identity(
            nonce in any::<u64>(),
            balance_bytes in proptest::collection::vec(any::<u8>(), 0..=32),
            hash in proptest::option::of(any::<[u8; 32]>()),
            incarnation in any::<u64>(),
        ) {
            let acc = Account::new(
                nonce,
                U256::from_big_endian(&balance_bytes),
                hash,
                incarnation,
            );
            prop_assert_eq!(Account::decode(&acc.encode()).unwrap(), acc);
        }
    }
}
