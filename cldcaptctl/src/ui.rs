use comfy_table::presets::UTF8_FULL;
use comfy_table::*;
use libcldcapt::core::{
    planner::{Plan, PlanAction},
    resolver::ItemRef,
};
use uuid::Uuid;

pub fn print_comfy_table(header: Vec<Cell>, rows: impl Iterator<Item = Vec<Cell>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);

    rows.for_each(|r| {
        table.add_row(r);
    });

    println!("{}", table);
}

pub fn comfy_header(name: &str) -> Cell {
    Cell::new(name).add_attribute(Attribute::Bold)
}

pub fn comfy_id_value(uuid: Uuid) -> Cell {
    Cell::new(&uuid.to_string()[0..8])
        .fg(Color::Blue)
        .add_attribute(Attribute::Bold)
}

pub fn comfy_name_value<T: ToString>(name: T) -> Cell {
    Cell::new(name).fg(Color::Blue)
}

pub fn item_label(item: ItemRef) -> String {
    match item {
        ItemRef::Existing(uuid) => uuid.to_string()[0..8].to_string(),
        ItemRef::Proposed => "(new)".to_string(),
    }
}

pub fn print_plan(source: &str, remote: &str, plan: &Plan) {
    println!();
    println!("Plan for {} -> {}:", source, remote);
    if plan.is_empty() {
        println!("  nothing to do");
        return;
    }

    print_comfy_table(
        vec![comfy_header("Action"), comfy_header("Target"), comfy_header("Detail")],
        plan.actions.iter().map(|action| match action {
            PlanAction::RenameSnapshot { from, to, .. } => vec![
                Cell::new("rename snapshot"),
                comfy_name_value(from),
                Cell::new(format!("-> {}", to)),
            ],
            PlanAction::CreateSnapshot => vec![
                Cell::new("create snapshot").fg(Color::Green),
                comfy_name_value(source),
                Cell::new(""),
            ],
            PlanAction::CreateBackup { item, send_parent } => vec![
                Cell::new("upload backup").fg(Color::Green),
                comfy_name_value(item_label(*item)),
                Cell::new(match send_parent {
                    Some(parent) => format!("delta from {}", item_label(*parent)),
                    None => "full".to_string(),
                }),
            ],
            PlanAction::DeleteBackup { key, .. } => vec![
                Cell::new("delete backup").fg(Color::Red),
                comfy_name_value(key),
                Cell::new(""),
            ],
            PlanAction::DeleteSnapshot { name, .. } => vec![
                Cell::new("delete snapshot").fg(Color::Red),
                comfy_name_value(name),
                Cell::new(""),
            ],
        }),
    );
}
