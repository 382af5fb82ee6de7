//! TPM device identity carried in the EK certificate's subject alternative
//! name, as laid out by the TCG EK Credential Profile.

use der::asn1::ObjectIdentifier;
use der::{Any, Decode, Tag, Tagged};
use std::fmt;
use thiserror::Error;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::Certificate;

pub const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
pub const OID_TCG_TPM_MANUFACTURER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.23.133.2.1");
pub const OID_TCG_TPM_MODEL: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.23.133.2.2");
pub const OID_TCG_TPM_VERSION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.23.133.2.3");

#[derive(Error, Debug, PartialEq)]
pub enum AttributeError {
    #[error("certificate has no subject alternative name extension")]
    MissingSubjectAltName,
    #[error("cannot decode subject alternative name: {0}")]
    MalformedSubjectAltName(String),
    #[error("subject alternative name has no TPM {0} attribute")]
    MissingAttribute(&'static str),
    #[error("TPM {0} attribute appears more than once")]
    DuplicateAttribute(&'static str),
    #[error("TPM {name} attribute has an invalid value `{value}`")]
    InvalidValue { name: &'static str, value: String },
    #[error("TPM {0} attribute is not a string")]
    NotAString(&'static str),
}

pub type Result<T, E = AttributeError> = core::result::Result<T, E>;

/// TCG vendor ID, four ASCII characters packed big endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TpmManufacturer(pub u32);

impl TpmManufacturer {
    pub const AMD: Self = Self(0x414d4400);
    pub const ATMEL: Self = Self(0x41544d4c);
    pub const BROADCOM: Self = Self(0x4252434d);
    pub const GOOGLE: Self = Self(0x474f4f47);
    pub const IBM: Self = Self(0x49424d00);
    pub const INFINEON: Self = Self(0x49465800);
    pub const INTEL: Self = Self(0x494e5443);
    pub const LENOVO: Self = Self(0x4c454e00);
    pub const MICROSOFT: Self = Self(0x4d534654);
    pub const NATIONAL_SEMI: Self = Self(0x4e534d20);
    pub const NUVOTON: Self = Self(0x4e544300);
    pub const QUALCOMM: Self = Self(0x51434f4d);
    pub const ST_MICRO: Self = Self(0x53544d20);
}

impl fmt::Display for TpmManufacturer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        match bytes.iter().all(|b| *b == 0 || b.is_ascii_graphic() || *b == b' ') {
            true => {
                let id: String = bytes.iter().filter(|b| **b != 0).map(|b| *b as char).collect();
                f.write_str(id.trim_end())
            }
            false => write!(f, "{:#010x}", self.0),
        }
    }
}

/// Identity claims of a TPM, only ever produced from a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttributes {
    pub manufacturer: TpmManufacturer,
    pub model: String,
    pub firmware_version: u32,
}

impl DeviceAttributes {
    /// Extracts the manufacturer, model and firmware version from the
    /// directory name in `cert`'s subject alternative name extension.
    pub fn from_certificate(cert: &Certificate) -> Result<Self> {
        let extension = cert
            .tbs_certificate
            .extensions
            .iter()
            .flatten()
            .find(|e| e.extn_id == OID_SUBJECT_ALT_NAME)
            .ok_or(AttributeError::MissingSubjectAltName)?;

        let san = SubjectAltName::from_der(extension.extn_value.as_bytes())
            .map_err(|e| AttributeError::MalformedSubjectAltName(e.to_string()))?;

        let mut manufacturer = None;
        let mut model = None;
        let mut version = None;

        let attributes = san
            .0
            .iter()
            .filter_map(|name| match name {
                GeneralName::DirectoryName(dn) => Some(dn),
                _ => None,
            })
            .flat_map(|dn| dn.0.iter())
            .flat_map(|rdn| rdn.0.iter());

        for atv in attributes {
            let (slot, name) = match atv.oid {
                oid if oid == OID_TCG_TPM_MANUFACTURER => (&mut manufacturer, "manufacturer"),
                oid if oid == OID_TCG_TPM_MODEL => (&mut model, "model"),
                oid if oid == OID_TCG_TPM_VERSION => (&mut version, "version"),
                _ => continue,
            };
            if slot.is_some() {
                return Err(AttributeError::DuplicateAttribute(name));
            }
            *slot = Some(attribute_string(&atv.value, name)?);
        }

        let manufacturer =
            manufacturer.ok_or(AttributeError::MissingAttribute("manufacturer"))?;
        let model = model.ok_or(AttributeError::MissingAttribute("model"))?;
        let version = version.ok_or(AttributeError::MissingAttribute("version"))?;

        Ok(Self {
            manufacturer: TpmManufacturer(parse_id(&manufacturer, "manufacturer")?),
            model,
            firmware_version: parse_id(&version, "version")?,
        })
    }
}

fn attribute_string(value: &Any, name: &'static str) -> Result<String> {
    match value.tag() {
        Tag::Utf8String | Tag::PrintableString | Tag::Ia5String => {
            String::from_utf8(value.value().to_vec()).map_err(|_| AttributeError::NotAString(name))
        }
        _ => Err(AttributeError::NotAString(name)),
    }
}

/// Parses `id:` followed by eight hex digits into a big endian u32.
fn parse_id(value: &str, name: &'static str) -> Result<u32> {
    let invalid = || AttributeError::InvalidValue {
        name,
        value: value.to_owned(),
    };
    let digits = value.strip_prefix("id:").ok_or_else(invalid)?;
    if digits.len() != 8 {
        return Err(invalid());
    }
    let bytes = hex::decode(digits).map_err(|_| invalid())?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
