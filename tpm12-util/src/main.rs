// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fs_err as fs;
use tpm12::state::{auth_protocol_for, AuthProtocol};
use tpm12::{
    auth, tpm_cap_prop, tpm_kh, AuthValue, KeyBlob, Marshal, PcrSelection, SessionAuth, TpmCap,
    TpmConfig, TpmContext, TpmEntityType, TpmKeyFlags, TpmKeyUsage, TpmOrd, TpmResourceType,
    TpmStartupType,
};
use tracing::{debug, info};

use args::{
    label, parse_digest, parse_handle, parse_hex, parse_number, read_structure, required_secret,
    secret,
};

mod args;

/// TPM 1.2 utility
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// debug logging including raw command and response dumps
    #[arg(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a wrapped key under a parent key
    Loadkey(LoadKeyArgs),
    /// List the handles of loaded keys
    Listkeys,
    /// Evict one or all loaded keys
    Evictkey(EvictKeyArgs),
    /// Read the public part of a loaded key
    Getpubkey(GetPubKeyArgs),
    /// Create a new RSA key wrapped by a storage key
    Createwrapkey(CreateWrapKeyArgs),
    /// Sign the SHA-1 digest of a file
    Sign(SignArgs),
    /// Monotonic counters
    #[command(subcommand)]
    Counter(CounterCommand),
    /// Extend a PCR
    Extend(ExtendArgs),
    /// Read one or all PCRs
    Pcrread(PcrReadArgs),
    /// Reset resettable PCRs
    Pcrreset(PcrResetArgs),
    /// Read a DIR register
    Dirread(DirReadArgs),
    /// Write a DIR register
    Dirwrite(DirWriteArgs),
    /// Save a key or session context to a file
    Savecontext(SaveContextArgs),
    /// Load a context saved by savecontext
    Loadcontext(LoadContextArgs),
    /// Run the self-test and show its result
    Selftest(SelfTestArgs),
    /// Get random bytes from the TPM
    Random(RandomArgs),
    /// Query a capability
    Getcapability(GetCapabilityArgs),
    /// Show the audit digest
    Auditdigest(AuditDigestArgs),
    /// Turn auditing of an ordinal on or off
    Setaudit(SetAuditArgs),
    /// Send TPM_Startup
    Startup(StartupArgs),
}

#[derive(Parser)]
/// Load a wrapped key
struct LoadKeyArgs {
    /// parent key handle (hex)
    #[arg(long = "hp", value_parser = parse_handle, default_value = "40000000")]
    parent: u32,
    /// parent key password
    #[arg(long = "pwdp")]
    parent_password: Option<String>,
    /// file holding the parent's raw 20 byte secret
    #[arg(long = "pwdpf")]
    parent_password_file: Option<PathBuf>,
    /// wrapped key file
    #[arg(short, long)]
    input: PathBuf,
    /// use TPM_LoadKey instead of TPM_LoadKey2
    #[arg(long)]
    legacy: bool,
}

#[derive(Parser)]
/// Evict keys
struct EvictKeyArgs {
    /// key handle (hex)
    #[arg(long = "hk", value_parser = parse_handle, required_unless_present = "all")]
    handle: Option<u32>,
    /// evict every loaded key
    #[arg(long, conflicts_with = "handle")]
    all: bool,
}

#[derive(Parser)]
/// Read a public key
struct GetPubKeyArgs {
    /// key handle (hex)
    #[arg(long = "hk", value_parser = parse_handle)]
    handle: u32,
    /// key password
    #[arg(long = "pwdk")]
    key_password: Option<String>,
    /// file holding the key's raw 20 byte secret
    #[arg(long = "pwdkf")]
    key_password_file: Option<PathBuf>,
    /// write the TPM_PUBKEY structure to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum KeyType {
    Sign,
    Storage,
    Bind,
    Legacy,
}

impl From<KeyType> for TpmKeyUsage {
    fn from(kind: KeyType) -> Self {
        match kind {
            KeyType::Sign => TpmKeyUsage::Signing,
            KeyType::Storage => TpmKeyUsage::Storage,
            KeyType::Bind => TpmKeyUsage::Bind,
            KeyType::Legacy => TpmKeyUsage::Legacy,
        }
    }
}

#[derive(Parser)]
/// Create a wrapped key
struct CreateWrapKeyArgs {
    /// parent key handle (hex)
    #[arg(long = "hp", value_parser = parse_handle, default_value = "40000000")]
    parent: u32,
    /// parent key password
    #[arg(long = "pwdp")]
    parent_password: Option<String>,
    /// file holding the parent's raw 20 byte secret
    #[arg(long = "pwdpf")]
    parent_password_file: Option<PathBuf>,
    /// password of the new key
    #[arg(long = "pwdk")]
    key_password: Option<String>,
    /// file holding the new key's raw 20 byte secret
    #[arg(long = "pwdkf")]
    key_password_file: Option<PathBuf>,
    /// migration password; the key is migratable when given
    #[arg(long = "pwdm")]
    migration_password: Option<String>,
    #[arg(long = "type", value_enum, default_value = "sign")]
    key_type: KeyType,
    /// modulus size in bits
    #[arg(long, default_value_t = 2048)]
    bits: u32,
    /// wrapped key output file
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Parser)]
/// Sign a file
struct SignArgs {
    /// signing key handle (hex)
    #[arg(long = "hk", value_parser = parse_handle)]
    handle: u32,
    /// key password
    #[arg(long = "pwdk")]
    key_password: Option<String>,
    /// file holding the key's raw 20 byte secret
    #[arg(long = "pwdkf")]
    key_password_file: Option<PathBuf>,
    /// file whose SHA-1 digest is signed
    #[arg(short, long)]
    input: PathBuf,
    /// signature output file; printed as hex otherwise
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum CounterCommand {
    /// Create a counter (owner authorized)
    Create {
        /// owner password
        #[arg(long = "pwdo")]
        owner_password: Option<String>,
        /// file holding the owner's raw 20 byte secret
        #[arg(long = "pwdof")]
        owner_password_file: Option<PathBuf>,
        /// password of the new counter
        #[arg(long = "pwdc")]
        counter_password: String,
        /// up to 4 label bytes
        #[arg(long, default_value = "CNT")]
        label: String,
    },
    /// Increment a counter
    Increment {
        /// counter id
        #[arg(long, value_parser = parse_number)]
        id: u32,
        /// counter password
        #[arg(long = "pwdc")]
        counter_password: String,
    },
    /// Read a counter
    Read {
        /// counter id
        #[arg(long, value_parser = parse_number)]
        id: u32,
    },
    /// Release a counter
    Release {
        /// counter id
        #[arg(long, value_parser = parse_number)]
        id: u32,
        /// counter password, or the owner password with --owner
        #[arg(long = "pwd")]
        password: String,
        /// authorize with the owner instead of the counter
        #[arg(long)]
        owner: bool,
    },
}

#[derive(Parser)]
/// Extend a PCR
struct ExtendArgs {
    /// PCR index
    #[arg(long, value_parser = parse_number)]
    pcr: u32,
    /// hex encoded 20 byte digest
    #[arg(long, value_parser = parse_digest, required_unless_present = "text")]
    digest: Option<tpm12::Digest>,
    /// extend with the SHA-1 of this text instead
    #[arg(long, conflicts_with = "digest")]
    text: Option<String>,
}

#[derive(Parser)]
/// Read PCRs
struct PcrReadArgs {
    /// PCR index; all PCRs when omitted
    #[arg(long, value_parser = parse_number)]
    pcr: Option<u32>,
}

#[derive(Parser)]
/// Reset PCRs
struct PcrResetArgs {
    /// PCR indices, comma separated
    #[arg(long, value_parser = parse_number, value_delimiter = ',', required = true)]
    pcrs: Vec<u32>,
}

#[derive(Parser)]
/// Read a DIR
struct DirReadArgs {
    #[arg(long, value_parser = parse_number, default_value = "0")]
    index: u32,
}

#[derive(Parser)]
/// Write a DIR
struct DirWriteArgs {
    #[arg(long, value_parser = parse_number, default_value = "0")]
    index: u32,
    /// hex encoded 20 byte value
    #[arg(long, value_parser = parse_digest)]
    value: tpm12::Digest,
    /// owner password
    #[arg(long = "pwdo")]
    owner_password: Option<String>,
    /// file holding the owner's raw 20 byte secret
    #[arg(long = "pwdof")]
    owner_password_file: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ContextKind {
    Key,
    Auth,
}

#[derive(Parser)]
/// Save a context
struct SaveContextArgs {
    /// handle of the key or session (hex)
    #[arg(long = "ha", value_parser = parse_handle)]
    handle: u32,
    #[arg(long = "type", value_enum, default_value = "key")]
    kind: ContextKind,
    /// up to 16 label bytes
    #[arg(long, default_value = "")]
    label: String,
    /// use TPM_SaveKeyContext (keys only)
    #[arg(long)]
    legacy: bool,
    /// context output file
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Parser)]
/// Load a context
struct LoadContextArgs {
    /// context file
    #[arg(short, long)]
    input: PathBuf,
    /// handle to restore under (hex)
    #[arg(long = "ha", value_parser = parse_handle, default_value = "0")]
    handle: u32,
    /// ask the TPM to keep the saved handle
    #[arg(long)]
    keep: bool,
    /// the file holds a TPM_SaveKeyContext blob
    #[arg(long)]
    legacy: bool,
}

#[derive(Parser)]
/// Self-test
struct SelfTestArgs {
    /// run TPM_ContinueSelfTest instead of the full test
    #[arg(long = "continue")]
    continue_test: bool,
}

#[derive(Parser)]
/// Generate random data
struct RandomArgs {
    /// number of bytes to generate
    #[arg(short = 'n', long, default_value_t = 20)]
    bytes: usize,
    /// stir this hex data into the RNG first
    #[arg(long)]
    stir: Option<String>,
    /// output to file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum CapArea {
    Ord,
    Flag,
    Property,
    Version,
    KeyHandle,
    Handle,
    Mfr,
}

impl From<CapArea> for TpmCap {
    fn from(area: CapArea) -> Self {
        match area {
            CapArea::Ord => TpmCap::Ord,
            CapArea::Flag => TpmCap::Flag,
            CapArea::Property => TpmCap::Property,
            CapArea::Version => TpmCap::Version,
            CapArea::KeyHandle => TpmCap::KeyHandle,
            CapArea::Handle => TpmCap::Handle,
            CapArea::Mfr => TpmCap::Mfr,
        }
    }
}

#[derive(Parser)]
/// Query a capability
struct GetCapabilityArgs {
    #[arg(long, value_enum)]
    cap: CapArea,
    /// sub-capability as a number (property, ordinal or resource type)
    #[arg(long, value_parser = parse_number)]
    sub: Option<u32>,
}

#[derive(Parser)]
/// Audit digest
struct AuditDigestArgs {
    /// have this loaded key sign the digest (hex)
    #[arg(long = "hk", value_parser = parse_handle)]
    signed_by: Option<u32>,
    /// key password
    #[arg(long = "pwdk")]
    key_password: Option<String>,
    /// file holding the key's raw 20 byte secret
    #[arg(long = "pwdkf")]
    key_password_file: Option<PathBuf>,
    /// anti-replay nonce (hex); random when omitted
    #[arg(long, value_parser = parse_digest)]
    nonce: Option<tpm12::Digest>,
    /// close the audit session after signing
    #[arg(long)]
    close: bool,
}

#[derive(Parser)]
/// Set ordinal audit status
struct SetAuditArgs {
    #[arg(long, value_parser = parse_number)]
    ordinal: u32,
    /// stop auditing instead of starting
    #[arg(long)]
    off: bool,
    /// owner password
    #[arg(long = "pwdo")]
    owner_password: Option<String>,
    /// file holding the owner's raw 20 byte secret
    #[arg(long = "pwdof")]
    owner_password_file: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum StartupKind {
    Clear,
    State,
    Deactivated,
}

#[derive(Parser)]
/// Startup
struct StartupArgs {
    #[arg(long = "type", value_enum, default_value = "clear")]
    kind: StartupKind,
}

fn key_entity(handle: u32) -> (TpmEntityType, u32) {
    if handle == tpm_kh::SRK {
        (TpmEntityType::Srk, handle)
    } else {
        (TpmEntityType::KeyHandle, handle)
    }
}

/// Run one command under a fresh single-use session of the kind the
/// ordinal needs
fn authorized<T>(
    ctx: &TpmContext,
    ordinal: TpmOrd,
    (entity_type, entity_value): (TpmEntityType, u32),
    entity_auth: &AuthValue,
    f: impl FnOnce(SessionAuth<'_>) -> tpm12::Result<T>,
) -> Result<T> {
    let mut session = match auth_protocol_for(ordinal) {
        AuthProtocol::Oiap => ctx.oiap(),
        AuthProtocol::Osap => ctx.osap(entity_type, entity_value, entity_auth),
    }
    .with_context(|| format!("failed to open a session for {ordinal:?}"))?;
    f(SessionAuth::new(&mut session, entity_auth).last_use())
        .with_context(|| format!("{ordinal:?} failed"))
}

fn maybe_authorized<T>(
    ctx: &TpmContext,
    ordinal: TpmOrd,
    entity: (TpmEntityType, u32),
    entity_auth: Option<&AuthValue>,
    f: impl FnOnce(Option<SessionAuth<'_>>) -> tpm12::Result<T>,
) -> Result<T> {
    match entity_auth {
        Some(entity_auth) => authorized(ctx, ordinal, entity, entity_auth, |a| f(Some(a))),
        None => f(None).with_context(|| format!("{ordinal:?} failed")),
    }
}

fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)?;
    info!("wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}

fn cmd_loadkey(ctx: &TpmContext, args: LoadKeyArgs) -> Result<()> {
    let key: KeyBlob = read_structure(&args.input)?;
    let parent_auth = secret(
        args.parent_password.as_deref(),
        args.parent_password_file.as_deref(),
    )?;
    let ordinal = if args.legacy {
        TpmOrd::LoadKey
    } else {
        TpmOrd::LoadKey2
    };
    let handle = maybe_authorized(
        ctx,
        ordinal,
        key_entity(args.parent),
        parent_auth.as_ref(),
        |auth| {
            if args.legacy {
                ctx.load_key(args.parent, auth, &key)
            } else {
                ctx.load_key2(args.parent, auth, &key)
            }
        },
    )?;
    println!("New Key Handle = {handle:08X}");
    Ok(())
}

fn cmd_listkeys(ctx: &TpmContext) -> Result<()> {
    let handles = ctx.list_keys().context("failed to list keys")?;
    if handles.is_empty() {
        println!("No keys loaded");
    }
    for handle in handles {
        println!("{handle:08X}");
    }
    Ok(())
}

fn cmd_evictkey(ctx: &TpmContext, args: EvictKeyArgs) -> Result<()> {
    if args.all {
        let evicted = ctx.evict_all().context("failed to evict keys")?;
        println!("Evicted {evicted} keys");
        return Ok(());
    }
    let Some(handle) = args.handle else {
        bail!("a key handle or --all is required");
    };
    ctx.evict_key(handle)
        .with_context(|| format!("failed to evict key {handle:08X}"))?;
    println!("Evicted key {handle:08X}");
    Ok(())
}

fn cmd_getpubkey(ctx: &TpmContext, args: GetPubKeyArgs) -> Result<()> {
    let key_auth = secret(
        args.key_password.as_deref(),
        args.key_password_file.as_deref(),
    )?;
    let pubkey = maybe_authorized(
        ctx,
        TpmOrd::GetPubKey,
        key_entity(args.handle),
        key_auth.as_ref(),
        |auth| ctx.get_pub_key(args.handle, auth),
    )?;
    if let Some(output) = &args.output {
        write_output(output, &pubkey.to_bytes()?)?;
    }
    println!("Modulus: {}", hex::encode(&pubkey.pub_key.key));
    Ok(())
}

fn cmd_createwrapkey(ctx: &TpmContext, args: CreateWrapKeyArgs) -> Result<()> {
    let parent_auth = secret(
        args.parent_password.as_deref(),
        args.parent_password_file.as_deref(),
    )?
    .unwrap_or_else(AuthValue::well_known);
    let usage_auth = required_secret(
        args.key_password.as_deref(),
        args.key_password_file.as_deref(),
        "key",
    )?;
    let mut flags = TpmKeyFlags::new();
    let migration_auth = match &args.migration_password {
        Some(password) => {
            flags = flags.with_migratable();
            AuthValue::from_password(password)
        }
        None => AuthValue::well_known(),
    };
    let template = KeyBlob::template(args.key_type.into(), args.bits, flags);

    let key = authorized(
        ctx,
        TpmOrd::CreateWrapKey,
        key_entity(args.parent),
        &parent_auth,
        |auth| ctx.create_wrap_key(args.parent, auth, &usage_auth, &migration_auth, &template),
    )?;
    write_output(&args.output, &key.to_bytes()?)?;
    println!("Modulus: {}", hex::encode(&key.pub_key.key));
    Ok(())
}

fn cmd_sign(ctx: &TpmContext, args: SignArgs) -> Result<()> {
    let data = fs::read(&args.input)?;
    let digest = auth::sha1(&[&data]);
    let key_auth = secret(
        args.key_password.as_deref(),
        args.key_password_file.as_deref(),
    )?;
    let signature = maybe_authorized(
        ctx,
        TpmOrd::Sign,
        key_entity(args.handle),
        key_auth.as_ref(),
        |auth| ctx.sign(args.handle, auth, &digest),
    )?;
    match &args.output {
        Some(output) => write_output(output, &signature)?,
        None => println!("{}", hex::encode(&signature)),
    }
    Ok(())
}

fn cmd_counter(ctx: &TpmContext, command: CounterCommand) -> Result<()> {
    match command {
        CounterCommand::Create {
            owner_password,
            owner_password_file,
            counter_password,
            label: text,
        } => {
            let owner_auth = required_secret(
                owner_password.as_deref(),
                owner_password_file.as_deref(),
                "owner",
            )?;
            let counter_auth = AuthValue::from_password(&counter_password);
            let label = label::<4>(&text)?;
            let (id, value) = authorized(
                ctx,
                TpmOrd::CreateCounter,
                (TpmEntityType::Owner, tpm_kh::OWNER),
                &owner_auth,
                |auth| ctx.create_counter(auth, &counter_auth, label),
            )?;
            println!("New counter id = {id}, value = {}", value.counter);
        }
        CounterCommand::Increment {
            id,
            counter_password,
        } => {
            let counter_auth = AuthValue::from_password(&counter_password);
            let value = authorized(
                ctx,
                TpmOrd::IncrementCounter,
                (TpmEntityType::Counter, id),
                &counter_auth,
                |auth| ctx.increment_counter(id, auth),
            )?;
            println!("Counter {id} = {}", value.counter);
        }
        CounterCommand::Read { id } => {
            let value = ctx
                .read_counter(id)
                .with_context(|| format!("failed to read counter {id}"))?;
            println!(
                "Counter {id} = {} (label {})",
                value.counter,
                String::from_utf8_lossy(&value.label).trim_end_matches('\0')
            );
        }
        CounterCommand::Release {
            id,
            password,
            owner,
        } => {
            let entity_auth = AuthValue::from_password(&password);
            if owner {
                authorized(
                    ctx,
                    TpmOrd::ReleaseCounterOwner,
                    (TpmEntityType::Owner, tpm_kh::OWNER),
                    &entity_auth,
                    |auth| ctx.release_counter_owner(id, auth),
                )?;
            } else {
                authorized(
                    ctx,
                    TpmOrd::ReleaseCounter,
                    (TpmEntityType::Counter, id),
                    &entity_auth,
                    |auth| ctx.release_counter(id, auth),
                )?;
            }
            println!("Released counter {id}");
        }
    }
    Ok(())
}

fn cmd_extend(ctx: &TpmContext, args: ExtendArgs) -> Result<()> {
    let digest = match (args.digest, &args.text) {
        (Some(digest), _) => digest,
        (None, Some(text)) => auth::sha1(&[text.as_bytes()]),
        (None, None) => bail!("a digest or --text is required"),
    };
    let value = ctx
        .extend(args.pcr, &digest)
        .with_context(|| format!("failed to extend PCR {}", args.pcr))?;
    println!("PCR {:02} = {}", args.pcr, hex::encode(value));
    Ok(())
}

fn cmd_pcrread(ctx: &TpmContext, args: PcrReadArgs) -> Result<()> {
    let pcrs = match args.pcr {
        Some(pcr) => pcr..pcr + 1,
        None => {
            let count = ctx
                .get_capability_u32(TpmCap::Property, tpm_cap_prop::PCR)
                .context("failed to read the PCR count")?;
            0..count
        }
    };
    for pcr in pcrs {
        let value = ctx
            .pcr_read(pcr)
            .with_context(|| format!("failed to read PCR {pcr}"))?;
        println!("PCR {pcr:02} = {}", hex::encode(value));
    }
    Ok(())
}

fn cmd_pcrreset(ctx: &TpmContext, args: PcrResetArgs) -> Result<()> {
    let selection = PcrSelection::new(&args.pcrs)?;
    ctx.pcr_reset(&selection).context("failed to reset PCRs")?;
    println!("Reset PCRs {:?}", selection.indices());
    Ok(())
}

fn cmd_dirwrite(ctx: &TpmContext, args: DirWriteArgs) -> Result<()> {
    let owner_auth = required_secret(
        args.owner_password.as_deref(),
        args.owner_password_file.as_deref(),
        "owner",
    )?;
    authorized(
        ctx,
        TpmOrd::DirWriteAuth,
        (TpmEntityType::Owner, tpm_kh::OWNER),
        &owner_auth,
        |auth| ctx.dir_write_auth(args.index, &args.value, auth),
    )?;
    println!("DIR {} written", args.index);
    Ok(())
}

fn cmd_savecontext(ctx: &TpmContext, args: SaveContextArgs) -> Result<()> {
    let blob = match (args.kind, args.legacy) {
        (ContextKind::Key, true) => ctx
            .save_key_context(args.handle)
            .with_context(|| format!("failed to save key {:08X}", args.handle))?,
        (ContextKind::Auth, true) => bail!("--legacy saves keys only"),
        (kind, false) => {
            let resource_type = match kind {
                ContextKind::Key => TpmResourceType::Key,
                ContextKind::Auth => TpmResourceType::Auth,
            };
            ctx.save_context(args.handle, resource_type, label::<16>(&args.label)?)
                .with_context(|| format!("failed to save {:08X}", args.handle))?
                .to_bytes()?
        }
    };
    write_output(&args.output, &blob)
}

fn cmd_loadcontext(ctx: &TpmContext, args: LoadContextArgs) -> Result<()> {
    let handle = if args.legacy {
        let blob = fs::read(&args.input)?;
        ctx.load_key_context(&blob)
            .context("failed to load key context")?
    } else {
        let blob: tpm12::ContextBlob = read_structure(&args.input)?;
        ctx.load_context(args.handle, args.keep, &blob)
            .context("failed to load context")?
    };
    println!("New Handle = {handle:08X}");
    Ok(())
}

fn cmd_selftest(ctx: &TpmContext, args: SelfTestArgs) -> Result<()> {
    if args.continue_test {
        ctx.continue_self_test()
            .context("continue self-test failed")?;
    } else {
        ctx.self_test_full().context("self-test failed")?;
    }
    let result = ctx
        .get_test_result()
        .context("failed to read the test result")?;
    println!("Self-test result: {}", hex::encode(result));
    Ok(())
}

fn cmd_random(ctx: &TpmContext, args: RandomArgs) -> Result<()> {
    if let Some(entropy) = &args.stir {
        let entropy = parse_hex(entropy).map_err(anyhow::Error::msg)?;
        ctx.stir_random(&entropy)
            .context("failed to stir the RNG")?;
    }
    let data = ctx
        .get_random(args.bytes)
        .context("failed to get random bytes")?;
    match &args.output {
        Some(output) => write_output(output, &data),
        None => {
            println!("{}", hex::encode(data));
            Ok(())
        }
    }
}

fn cmd_getcapability(ctx: &TpmContext, args: GetCapabilityArgs) -> Result<()> {
    match (args.cap, args.sub) {
        (CapArea::Handle, Some(resource)) => {
            let Some(resource_type) = TpmResourceType::from_u32(resource) else {
                bail!("unknown resource type {resource}");
            };
            for handle in ctx.get_handle_list(resource_type)? {
                println!("{handle:08X}");
            }
        }
        (CapArea::KeyHandle, _) => {
            for handle in ctx.get_key_handles()? {
                println!("{handle:08X}");
            }
        }
        (CapArea::Property, Some(property)) => {
            let value = ctx.get_capability_u32(TpmCap::Property, property)?;
            println!("0x{property:08x} = {value} (0x{value:08x})");
        }
        (area, sub) => {
            let sub = sub.map(|s| s.to_be_bytes().to_vec()).unwrap_or_default();
            let resp = ctx.get_capability(area.into(), &sub)?;
            println!("{}", hex::encode(resp));
        }
    }
    Ok(())
}

fn cmd_auditdigest(ctx: &TpmContext, args: AuditDigestArgs) -> Result<()> {
    let Some(key) = args.signed_by else {
        let audit = ctx
            .get_audit_digest()
            .context("failed to read the audit digest")?;
        println!("Audit counter: {}", audit.counter.counter);
        println!("Audit digest: {}", hex::encode(audit.digest));
        for ordinal in audit.ordinals {
            let name = TpmOrd::from_u32(ordinal)
                .map(|o| format!("{o:?}"))
                .unwrap_or_default();
            println!("  0x{ordinal:08x} {name}");
        }
        return Ok(());
    };

    let key_auth = secret(
        args.key_password.as_deref(),
        args.key_password_file.as_deref(),
    )?;
    let nonce = args.nonce.unwrap_or_else(auth::random_nonce);
    let signed = maybe_authorized(
        ctx,
        TpmOrd::GetAuditDigestSigned,
        key_entity(key),
        key_auth.as_ref(),
        |auth| ctx.get_audit_digest_signed(key, auth, args.close, &nonce),
    )?;
    println!("Audit counter: {}", signed.counter.counter);
    println!("Audit digest: {}", hex::encode(signed.audit_digest));
    println!("Ordinal digest: {}", hex::encode(signed.ordinal_digest));
    println!("Signature: {}", hex::encode(&signed.signature));
    Ok(())
}

fn cmd_setaudit(ctx: &TpmContext, args: SetAuditArgs) -> Result<()> {
    let owner_auth = required_secret(
        args.owner_password.as_deref(),
        args.owner_password_file.as_deref(),
        "owner",
    )?;
    let audited = !args.off;
    authorized(
        ctx,
        TpmOrd::SetOrdinalAuditStatus,
        (TpmEntityType::Owner, tpm_kh::OWNER),
        &owner_auth,
        |auth| ctx.set_ordinal_audit_status(args.ordinal, audited, auth),
    )?;
    println!(
        "Auditing of 0x{:08x} {}",
        args.ordinal,
        if audited { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn cmd_startup(ctx: &TpmContext, args: StartupArgs) -> Result<()> {
    let startup_type = match args.kind {
        StartupKind::Clear => TpmStartupType::Clear,
        StartupKind::State => TpmStartupType::State,
        StartupKind::Deactivated => TpmStartupType::Deactivated,
    };
    ctx.startup(startup_type).context("startup failed")
}

fn run(cli: Cli) -> Result<()> {
    let config = TpmConfig::from_env()
        .context("invalid TPM configuration")?
        .with_wire_dump(cli.verbose);
    let ctx = TpmContext::new(config).context("failed to open the TPM")?;
    debug!("using TPM at {}", ctx.endpoint());

    match cli.command {
        Commands::Loadkey(args) => cmd_loadkey(&ctx, args)?,
        Commands::Listkeys => cmd_listkeys(&ctx)?,
        Commands::Evictkey(args) => cmd_evictkey(&ctx, args)?,
        Commands::Getpubkey(args) => cmd_getpubkey(&ctx, args)?,
        Commands::Createwrapkey(args) => cmd_createwrapkey(&ctx, args)?,
        Commands::Sign(args) => cmd_sign(&ctx, args)?,
        Commands::Counter(command) => cmd_counter(&ctx, command)?,
        Commands::Extend(args) => cmd_extend(&ctx, args)?,
        Commands::Pcrread(args) => cmd_pcrread(&ctx, args)?,
        Commands::Pcrreset(args) => cmd_pcrreset(&ctx, args)?,
        Commands::Dirread(args) => {
            let value = ctx
                .dir_read(args.index)
                .with_context(|| format!("failed to read DIR {}", args.index))?;
            println!("DIR {} = {}", args.index, hex::encode(value));
        }
        Commands::Dirwrite(args) => cmd_dirwrite(&ctx, args)?,
        Commands::Savecontext(args) => cmd_savecontext(&ctx, args)?,
        Commands::Loadcontext(args) => cmd_loadcontext(&ctx, args)?,
        Commands::Selftest(args) => cmd_selftest(&ctx, args)?,
        Commands::Random(args) => cmd_random(&ctx, args)?,
        Commands::Getcapability(args) => cmd_getcapability(&ctx, args)?,
        Commands::Auditdigest(args) => cmd_auditdigest(&ctx, args)?,
        Commands::Setaudit(args) => cmd_setaudit(&ctx, args)?,
        Commands::Startup(args) => cmd_startup(&ctx, args)?,
    }
    Ok(())
}

/// The TPM result code for TPM failures, -1 for other library failures and
/// -2 for bad input
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.chain().find_map(|e| e.downcast_ref::<tpm12::Error>()) {
        Some(tpm_err) => tpm_err.tpm_code().map_or(-1, |code| code as i32),
        None => -2,
    }
}

fn main() {
    let cli = Cli::parse();
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let default = if cli.verbose { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}
