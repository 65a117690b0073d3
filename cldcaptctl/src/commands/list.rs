use super::{load_config, CliFailure};
use crate::ui::{comfy_header, comfy_id_value, comfy_name_value, print_comfy_table};
use clap::Parser;
use comfy_table::Cell;
use libcldcapt::{
    core::inventory,
    sys::{btrfs::Subvolume, s3::S3Service},
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
pub struct ListOptions {
    /// Path to the configuration file.
    #[clap(short, long)]
    config: Option<PathBuf>,
}

pub async fn list_snapshots(options: ListOptions) -> Result<(), CliFailure> {
    let config = load_config(&options.config)?;
    for source in &config.sources {
        let subvolume = Subvolume::from_path(&source.path)?;
        let snapshots = inventory::scan_local_snapshots(&source.snapshots, &subvolume)?;

        println!();
        println!("Snapshots of {}:", source.path.display());
        print_comfy_table(
            vec![
                comfy_header("UUID"),
                comfy_header("Created"),
                comfy_header("Ctransid"),
                comfy_header("Name"),
            ],
            snapshots.iter().map(|snapshot| {
                vec![
                    comfy_id_value(snapshot.uuid),
                    Cell::new(snapshot.ctime.to_rfc3339()),
                    Cell::new(snapshot.ctransid),
                    comfy_name_value(&snapshot.name),
                ]
            }),
        );
    }
    Ok(())
}

pub async fn list_backups(options: ListOptions) -> Result<(), CliFailure> {
    let config = load_config(&options.config)?;
    for source in &config.sources {
        let subvolume = Subvolume::from_path(&source.path)?;
        for upload in &source.upload_to_remotes {
            let remote = match config.remote(&upload.id) {
                Some(remote) => remote,
                None => continue,
            };
            let store = S3Service::connect(remote).await?;
            let keys = store.list_keys().await?;
            let objects = inventory::decode_remote_objects(&keys, subvolume.uuid);

            println!();
            println!("Backups of {} in {}:", source.path.display(), store.bucket());
            print_comfy_table(
                vec![
                    comfy_header("UUID"),
                    comfy_header("Created"),
                    comfy_header("Kind"),
                    comfy_header("Key"),
                ],
                objects.iter().map(|object| {
                    vec![
                        comfy_id_value(object.meta.uuid),
                        Cell::new(object.meta.ctime.to_rfc3339()),
                        Cell::new(match object.meta.send_parent() {
                            Some(parent) => format!("delta of {}", &parent.to_string()[0..8]),
                            None => "full".to_string(),
                        }),
                        comfy_name_value(&object.key),
                    ]
                }),
            );
        }
    }
    Ok(())
}
