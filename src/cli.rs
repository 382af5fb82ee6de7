use clap::{Parser, Subcommand};
use eyre::Result;
use std::env;
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;
use zeroize::Zeroizing;

use crate::config::Config;
use crate::ek::{CertificateChain, ChainCertificate, RootCaFingerprint};
use crate::tpm::nv::delete_sealed_key;
use crate::tpm::{
    provision_tpm, EsapiTpm, Hierarchy, HierarchyAuthValues, ProvisionMode, Tpm2Commands,
    TpmConnection,
};

const TPM_ENV_VAR: &str = "TCTI";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TPM device specified in TCTI format, overrides the config file
    #[arg(short = 'T', long, env = TPM_ENV_VAR)]
    tcti: Option<String>,

    /// YAML configuration file
    #[arg(short, long, env = "TPM_SECBOOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the TPM and show what is known about it
    Status {
        /// Encoded EK certificate chain; the leaf is read from the TPM if absent
        #[arg(long, value_name = "FILE")]
        chain: Option<PathBuf>,
        /// Endorsement hierarchy auth value, needed when no valid persistent EK exists
        #[arg(long, env = "TPM_ENDORSEMENT_AUTH", hide_env_values = true)]
        endorsement_auth: Option<String>,
    },
    /// Create the EK and SRK and set hierarchy auth values
    Provision {
        #[arg(value_enum, default_value_t = ProvisionMode::Full)]
        mode: ProvisionMode,
        #[command(flatten)]
        current: CurrentAuth,
        /// New owner auth value
        #[arg(long, env = "TPM_NEW_OWNER_AUTH", hide_env_values = true)]
        new_owner_auth: Option<String>,
        /// New endorsement auth value
        #[arg(long, env = "TPM_NEW_ENDORSEMENT_AUTH", hide_env_values = true)]
        new_endorsement_auth: Option<String>,
        /// New lockout auth value, ignored by `without-lockout`
        #[arg(long, env = "TPM_NEW_LOCKOUT_AUTH", hide_env_values = true)]
        new_lockout_auth: Option<String>,
    },
    /// Encode DER certificates into an EK certificate chain file
    EncodeChain {
        /// EK certificate
        #[arg(long)]
        leaf: Option<PathBuf>,
        /// Issuer certificates, from the EK's issuer up to the root
        #[arg(short, long = "parent", value_name = "FILE")]
        parents: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the fingerprint to enroll for a DER root certificate
    Fingerprint {
        #[arg(value_name = "FILE")]
        certificate: PathBuf,
    },
    /// Delete a sealed key file and undefine its PIN index
    DeleteSealedKey {
        #[arg(value_name = "FILE")]
        path: PathBuf,
        #[command(flatten)]
        current: CurrentAuth,
    },
}

/// Auth values the TPM currently has.
#[derive(clap::Args, Debug)]
struct CurrentAuth {
    #[arg(long, env = "TPM_OWNER_AUTH", hide_env_values = true)]
    owner_auth: Option<String>,
    #[arg(long, env = "TPM_ENDORSEMENT_AUTH", hide_env_values = true)]
    endorsement_auth: Option<String>,
    #[arg(long, env = "TPM_LOCKOUT_AUTH", hide_env_values = true)]
    lockout_auth: Option<String>,
}

impl CurrentAuth {
    fn apply<T: Tpm2Commands>(&self, conn: &mut TpmConnection<T>) -> Result<()> {
        for (hierarchy, auth) in [
            (Hierarchy::Owner, &self.owner_auth),
            (Hierarchy::Endorsement, &self.endorsement_auth),
            (Hierarchy::Lockout, &self.lockout_auth),
        ] {
            if let Some(auth) = auth {
                conn.set_hierarchy_auth(hierarchy, auth.as_bytes())?;
            }
        }
        Ok(())
    }
}

fn secret(value: &Option<String>) -> Option<Zeroizing<Vec<u8>>> {
    value.as_ref().map(|v| Zeroizing::new(v.as_bytes().to_vec()))
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn run(&self) -> Result<&Self> {
        log::debug!("{:?}", self);
        match &self.command {
            Commands::Status {
                chain,
                endorsement_auth,
            } => status(
                &self.config()?,
                chain.as_ref(),
                endorsement_auth.as_deref(),
            )?,
            Commands::Provision {
                mode,
                current,
                new_owner_auth,
                new_endorsement_auth,
                new_lockout_auth,
            } => {
                let values = HierarchyAuthValues {
                    owner: secret(new_owner_auth),
                    endorsement: secret(new_endorsement_auth),
                    lockout: secret(new_lockout_auth),
                };
                let mut conn = TpmConnection::connect(open(&self.config()?)?)?;
                current.apply(&mut conn)?;
                provision_tpm(&mut conn, *mode, &values)?;
                conn.close()?;
                log::info!("TPM provisioned");
            }
            Commands::EncodeChain {
                leaf,
                parents,
                output,
            } => encode_chain(leaf.as_ref(), parents, output)?,
            Commands::Fingerprint { certificate } => {
                let der = fs::read(certificate)?;
                println!("{}", RootCaFingerprint::of_certificate(&der));
            }
            Commands::DeleteSealedKey { path, current } => {
                let mut conn = TpmConnection::connect(open(&self.config()?)?)?;
                current.apply(&mut conn)?;
                delete_sealed_key(&mut conn, path)?;
                conn.close()?;
            }
        };
        Ok(self)
    }

    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(tcti) = &self.tcti {
            config.tcti = tcti.clone();
        }
        Ok(config)
    }
}

fn open(config: &Config) -> Result<EsapiTpm> {
    env::set_var(TPM_ENV_VAR, &config.tcti);
    Ok(EsapiTpm::open(&config.tcti, &config.startup)?)
}

fn status(config: &Config, chain: Option<&PathBuf>, endorsement_auth: Option<&str>) -> Result<()> {
    let anchors = config.trust_anchors()?;
    let tpm = open(config)?;
    let mut conn = match anchors.is_empty() {
        true => {
            log::warn!("No root CAs configured, the TPM is not verified");
            TpmConnection::connect(tpm)?
        }
        false => {
            let mut file = chain.map(File::open).transpose()?;
            TpmConnection::secure_connect(
                tpm,
                &anchors,
                file.as_mut().map(|f| f as &mut dyn Read),
                endorsement_auth.map(str::as_bytes),
            )?
        }
    };

    println!("Enabled: {}", conn.is_enabled());
    match conn.ek_credential() {
        Some(ek) => println!("Endorsement key: {:?}", ek),
        None => println!("Endorsement key: none"),
    }
    if let Some(attributes) = conn.verified_device_attributes() {
        println!("Manufacturer: {}", attributes.manufacturer);
        println!("Model: {}", attributes.model);
        println!("Firmware version: {:#010x}", attributes.firmware_version);
    }
    for cert in conn.verified_ek_cert_chain() {
        println!("Certificate: {}", cert.certificate().tbs_certificate.subject);
    }
    conn.close()?;
    Ok(())
}

fn encode_chain(leaf: Option<&PathBuf>, parents: &[PathBuf], output: &PathBuf) -> Result<()> {
    let leaf = leaf
        .map(|path| fs::read(path).map(ChainCertificate::from_der))
        .transpose()?
        .transpose()?;
    let parents = parents
        .iter()
        .map(|path| -> Result<ChainCertificate> {
            Ok(ChainCertificate::from_der(fs::read(path)?)?)
        })
        .collect::<Result<Vec<_>>>()?;
    let chain = CertificateChain::new(leaf, parents);
    fs::write(output, chain.encode()?)?;
    log::info!("Wrote {} certificates to {}", chain.len(), output.display());
    Ok(())
}
