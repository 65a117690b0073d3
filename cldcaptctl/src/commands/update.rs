use super::{load_config, source_base, CliFailure};
use crate::ui;
use anyhow::Context as _;
use chrono::Utc;
use clap::Parser;
use libcldcapt::{
    core::{
        executor::{self, CreatedSnapshot, ExecuteContext},
        inventory::{self, SourceInventory},
        planner::{build_plan, Plan, PlanContext},
        resolver::{resolve, ResolveContext, Resolution},
        upload::CancelFlag,
    },
    model::{
        entities::{SourceEntity, UploadEntity},
        Config,
    },
    sys::{btrfs::Subvolume, fs::DirLock, s3::S3Service},
};
use slog_scope::info;
use std::{collections::BTreeSet, path::PathBuf};
use uuid::Uuid;

#[derive(Parser, Debug)]
pub struct UpdateOptions {
    /// Path to the configuration file.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Apply the plan without interactive confirmation.
    #[clap(long)]
    force: bool,
}

#[derive(Parser, Debug)]
pub struct PlanOptions {
    /// Path to the configuration file.
    #[clap(short, long)]
    config: Option<PathBuf>,
}

pub struct PreparedUpload<'a> {
    pub upload: &'a UploadEntity,
    pub store: S3Service,
    pub inventory: SourceInventory,
    pub resolution: Resolution,
}

/// Reads the source and every remote it uploads to, and resolves each
/// upload's keep set against the shared snapshot inventory.
pub async fn prepare_source<'a>(
    config: &Config,
    source: &'a SourceEntity,
) -> Result<Vec<PreparedUpload<'a>>, CliFailure> {
    let source_subvol = Subvolume::from_path(&source.path)?;
    let locals = inventory::scan_local_snapshots(&source.snapshots, &source_subvol)?;
    let base = source_base(&source.path);
    let now = Utc::now();

    let mut prepared = Vec::new();
    for upload in &source.upload_to_remotes {
        let remote = config
            .remote(&upload.id)
            .context("remote id is validated at config load")?;
        let store = S3Service::connect(remote).await?;
        let keys = store.list_keys().await?;
        let remotes = inventory::decode_remote_objects(&keys, source_subvol.uuid);
        let inventory = inventory::assemble(&source_subvol, base.clone(), locals.clone(), remotes);
        let resolution = resolve(
            &ResolveContext {
                policy: upload.preserve.entries(),
                tz: config.timezone,
                now,
            },
            &inventory.items,
        )
        .map_err(|e| CliFailure::Internal(e.to_string()))?;
        prepared.push(PreparedUpload {
            upload,
            store,
            inventory,
            resolution,
        });
    }
    Ok(prepared)
}

/// One plan per upload. Snapshots kept by any sibling upload are protected
/// from deletion, and only the first plan canonicalizes filenames.
pub fn build_plans(config: &Config, prepared: &[PreparedUpload]) -> Result<Vec<Plan>, CliFailure> {
    let keeps: Vec<BTreeSet<Uuid>> = prepared.iter().map(|p| p.resolution.keep_uuids()).collect();
    let mut plans = Vec::new();
    for (index, p) in prepared.iter().enumerate() {
        let shared: BTreeSet<Uuid> = keeps
            .iter()
            .enumerate()
            .filter(|(other, _)| *other != index)
            .flat_map(|(_, keep)| keep.iter().copied())
            .collect();
        let ctx = PlanContext {
            tz: config.timezone,
            shared_keep: &shared,
            names_authoritative: index == 0,
        };
        plans.push(
            build_plan(&p.inventory, &p.resolution, &ctx).map_err(|e| CliFailure::Internal(e.to_string()))?,
        );
    }
    Ok(plans)
}

pub async fn plan_command(options: PlanOptions) -> Result<(), CliFailure> {
    let config = load_config(&options.config)?;
    for source in &config.sources {
        let prepared = prepare_source(&config, source).await?;
        let plans = build_plans(&config, &prepared)?;
        for (p, plan) in prepared.iter().zip(&plans) {
            ui::print_plan(&source.path.to_string_lossy(), &p.upload.id, plan);
        }
    }
    Ok(())
}

pub async fn update_command(options: UpdateOptions) -> Result<(), CliFailure> {
    let config = load_config(&options.config)?;
    if !options.force && !console::user_attended() {
        return Err(CliFailure::Precondition);
    }

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut failed = 0usize;
    let mut cancelled = false;

    'sources: for source in &config.sources {
        let _lock = DirLock::acquire(&source.snapshots)?;
        let prepared = prepare_source(&config, source).await?;
        let plans = build_plans(&config, &prepared)?;

        for (p, plan) in prepared.iter().zip(&plans) {
            ui::print_plan(&source.path.to_string_lossy(), &p.upload.id, plan);
        }
        if plans.iter().all(|plan| plan.is_empty()) {
            info!("source is up to date"; "source" => source.path.to_string_lossy().into_owned());
            continue;
        }
        if !options.force && !confirm()? {
            info!("source skipped by operator"; "source" => source.path.to_string_lossy().into_owned());
            continue;
        }

        let mut created: Option<CreatedSnapshot> = None;
        for (p, plan) in prepared.iter().zip(&plans) {
            let exec_ctx = ExecuteContext {
                source_path: &source.path,
                snapshot_dir: &source.snapshots,
                tz: config.timezone,
                pipe_through: &p.upload.pipe_through,
                part_threshold: None,
                spill_dir: None,
                cancel: cancel.clone(),
            };
            let report = executor::execute(&exec_ctx, &p.store, plan, &p.inventory, created.take()).await;
            failed += report.failed;
            created = report.created;
            if report.cancelled {
                cancelled = true;
                break 'sources;
            }
        }
    }

    if cancelled {
        return Err(CliFailure::Other(anyhow::anyhow!("run cancelled by signal")));
    }
    if failed > 0 {
        return Err(CliFailure::Partial { failed });
    }
    Ok(())
}

fn confirm() -> Result<bool, CliFailure> {
    dialoguer::Confirm::new()
        .with_prompt("Apply these changes?")
        .default(false)
        .interact()
        .context("confirmation prompt failed")
        .map_err(CliFailure::Other)
}
