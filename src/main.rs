// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use anyhow::{anyhow, bail, Context, Result};
use lexopt::prelude::*;
use log::error;
use nvstate::{
    arena::NvEntry, store::FileStore, BuildConfig, PowerOnState, StateError, TpmEngine,
    TpmInstanceContext,
};
use std::{io::Write, path::PathBuf};

const USAGE: &str = "Usage: nvstate [--state-dir <PATH>] [--instance <ID>] [--tpm12|--tpm2] <init|verify|dump>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Init,
    Verify,
    Dump,
}

struct Args {
    state_dir: PathBuf,
    instance: String,
    engine: TpmEngine,
    action: Action,
}

fn parse_args() -> Result<Option<Args>> {
    let mut parser = lexopt::Parser::from_env();
    let mut state_dir: Option<PathBuf> = None;
    let mut instance = "0".to_string();
    let mut engine = TpmEngine::Tpm2;
    let mut action = None;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("state-dir") => state_dir = Some(PathBuf::from(parser.value()?)),
            Long("instance") => instance = parser.value()?.string()?,
            Long("tpm12") => engine = TpmEngine::Tpm12,
            Long("tpm2") => engine = TpmEngine::Tpm2,
            Short('h') | Long("help") => {
                eprintln!("{USAGE}");
                return Ok(None);
            }
            Value(value) if action.is_none() => {
                action = Some(match value.string()?.as_str() {
                    "init" => Action::Init,
                    "verify" => Action::Verify,
                    "dump" => Action::Dump,
                    other => bail!("unknown command: {other}"),
                });
            }
            _ => return Err(anyhow!("unexpected argument: {}", arg.unexpected())),
        }
    }

    let action = action.ok_or_else(|| anyhow!("{USAGE}"))?;
    let state_dir = state_dir.unwrap_or_else(|| {
        directories::ProjectDirs::from("org", "puavo", "nvstate")
            .map(|d| d.cache_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/tmp/nvstate"))
    });
    Ok(Some(Args {
        state_dir,
        instance,
        engine,
        action,
    }))
}

fn dump<W: Write>(
    ctx: &TpmInstanceContext<FileStore>,
    state: PowerOnState,
    writer: &mut W,
) -> Result<()> {
    let permanent = ctx
        .permanent()
        .ok_or_else(|| anyhow!("permanent state not loaded"))?;
    let pd = &permanent.persistent;
    writeln!(writer, "instance: {} ({})", ctx.instance_id(), ctx.engine())?;
    writeln!(writer, "state: {state:?}")?;
    writeln!(writer, "resetCount: {}", pd.reset_count)?;
    writeln!(writer, "totalResetCount: {}", pd.total_reset_count)?;
    writeln!(writer, "clearCount: {}", permanent.reset.clear_count)?;
    writeln!(writer, "orderlyState: {:#06x}", pd.orderly_state)?;
    writeln!(writer, "EPSeed: {}", hex::encode(&pd.ep_seed))?;
    writeln!(writer, "SPSeed: {}", hex::encode(&pd.sp_seed))?;
    writeln!(writer, "PPSeed: {}", hex::encode(&pd.pp_seed))?;
    let banks = ctx
        .pcr_allocation()
        .active_banks()
        .iter()
        .map(|alg| format!("{alg:#06x}"))
        .collect::<Vec<_>>();
    writeln!(writer, "pcrAllocated: [{}]", banks.join(", "))?;

    let entries = permanent.user_nvram.entries(ctx.config())?;
    writeln!(writer, "userNvram: {} records", entries.len())?;
    for entry in entries {
        match entry {
            NvEntry::Index { index, data } => writeln!(
                writer,
                "  nv {:#010x} attributes {:#010x} {} bytes",
                index.nv_index,
                index.attributes,
                data.len()
            )?,
            NvEntry::Object { handle, object } => writeln!(
                writer,
                "  object {handle:#010x} attributes {:#010x}",
                object.attributes
            )?,
        }
    }
    for record in permanent.index_orderly_ram.records()? {
        writeln!(
            writer,
            "  orderly {:#010x} {}",
            record.handle,
            hex::encode(&record.data)
        )?;
    }
    Ok(())
}

fn run() -> Result<i32> {
    let Some(args) = parse_args()? else {
        return Ok(0);
    };
    let store = FileStore::new(&args.state_dir);
    let mut ctx =
        TpmInstanceContext::new(BuildConfig::default(), args.engine, &args.instance, store)?;

    let state = match ctx.power_on() {
        Ok(state) => state,
        Err(StateError::FailureMode(reason)) => {
            error!("{reason}");
            println!("{}: failure mode", args.instance);
            return Ok(1);
        }
        Err(e) => return Err(e.into()),
    };

    match args.action {
        Action::Init => {
            if state != PowerOnState::Manufactured {
                bail!("{}: instance already exists", args.instance);
            }
            ctx.store_permanent().context("storing permanent state")?;
            ctx.store_volatile().context("storing volatile state")?;
            println!("{}: initialized in {}", args.instance, args.state_dir.display());
        }
        Action::Verify => println!("{}: {state:?}", args.instance),
        Action::Dump => dump(&ctx, state, &mut std::io::stdout().lock())?,
    }
    Ok(0)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("{err:#}");
            std::process::exit(1);
        }
    }
}
