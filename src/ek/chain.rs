//! Container format for an EK certificate plus the certificates above it.
//!
//! ```text
//! u16 leaf length (0 when absent) | leaf DER
//! u32 parent count
//! parent count x (u16 length | DER)
//! ```
//!
//! All integers are big endian, matching the TPM's own marshalling rules so
//! the same bytes can sit in an NV index or in a file handed to us by the
//! caller.

use der::Decode;
use std::io::Read;
use thiserror::Error;
use x509_cert::Certificate;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("certificate chain data is truncated")]
    Truncated,
    #[error("certificate chain claims {count} parents but only {remaining} bytes remain")]
    InvalidCount { count: u32, remaining: usize },
    #[error("{0} unexpected bytes after certificate chain")]
    TrailingData(usize),
    #[error("certificate {index} is not valid DER: {source}")]
    Certificate {
        index: usize,
        #[source]
        source: der::Error,
    },
    #[error("certificate of {0} bytes is too large for the chain container")]
    CertificateTooLarge(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ChainError> = core::result::Result<T, E>;

/// A parsed certificate which remembers the exact bytes it came from.
#[derive(Debug, Clone)]
pub struct ChainCertificate {
    raw: Vec<u8>,
    cert: Certificate,
}

impl ChainCertificate {
    pub fn from_der(raw: impl Into<Vec<u8>>) -> Result<Self, der::Error> {
        let raw = raw.into();
        let cert = Certificate::from_der(&raw)?;
        Ok(Self { raw, cert })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }
}

impl PartialEq for ChainCertificate {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for ChainCertificate {}

/// An EK certificate chain: optional leaf followed by its issuers, root last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateChain {
    pub leaf: Option<ChainCertificate>,
    pub parents: Vec<ChainCertificate>,
}

impl CertificateChain {
    pub fn new(leaf: Option<ChainCertificate>, parents: Vec<ChainCertificate>) -> Self {
        Self { leaf, parents }
    }

    /// Number of certificates held, leaf included.
    pub fn len(&self) -> usize {
        self.parents.len() + usize::from(self.leaf.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Leaf first, then parents in order.
    pub fn iter(&self) -> impl Iterator<Item = &ChainCertificate> {
        self.leaf.iter().chain(self.parents.iter())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match &self.leaf {
            Some(leaf) => put_sized(&mut out, leaf.raw())?,
            None => out.extend_from_slice(&0u16.to_be_bytes()),
        }
        let count = u32::try_from(self.parents.len())
            .map_err(|_| ChainError::CertificateTooLarge(self.parents.len()))?;
        out.extend_from_slice(&count.to_be_bytes());
        for parent in &self.parents {
            put_sized(&mut out, parent.raw())?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader { data };

        let leaf = reader.sized()?;
        let leaf = match leaf.is_empty() {
            true => None,
            false => Some(parse(leaf, 0)?),
        };

        let count = reader.u32()?;
        // every entry carries at least a two byte length
        if count as usize > reader.data.len() / 2 {
            return Err(ChainError::InvalidCount {
                count,
                remaining: reader.data.len(),
            });
        }

        let parents = (0..count as usize)
            .map(|i| reader.sized().and_then(|der| parse(der, i + 1)))
            .collect::<Result<Vec<_>>>()?;

        if !reader.data.is_empty() {
            return Err(ChainError::TrailingData(reader.data.len()));
        }

        Ok(Self { leaf, parents })
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::decode(&data)
    }
}

fn parse(der: &[u8], index: usize) -> Result<ChainCertificate> {
    ChainCertificate::from_der(der).map_err(|source| ChainError::Certificate { index, source })
}

fn put_sized(out: &mut Vec<u8>, der: &[u8]) -> Result<()> {
    let len = u16::try_from(der.len()).map_err(|_| ChainError::CertificateTooLarge(der.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(der);
    Ok(())
}

struct ByteReader<'a> {
    data: &'a [u8],
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(ChainError::Truncated);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn sized(&mut self) -> Result<&'a [u8]> {
        let len = self.take(2)?;
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        self.take(len)
    }
}
