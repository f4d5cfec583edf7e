use crate::core::{PendingRetry, RetryStatus};
use crate::engine::ScheduleEngine;
use crate::error::{ScheduleError, ScheduleResult};
use crate::identifier;
use crate::orders;
use crate::types::{BatchResult, OrderRecord, RowAddress, Timestamp, UndoToken};
use chrono::{DateTime, Duration, Utc};
use colored::Colorize;
use std::path::PathBuf;

/// Parse `Sheet!12` (or `Sheet:12`) into a row address
pub fn parse_row_address(raw: &str) -> ScheduleResult<RowAddress> {
    let (sheet, row) = raw
        .rsplit_once('!')
        .or_else(|| raw.rsplit_once(':'))
        .ok_or_else(|| ScheduleError::Config(format!("'{}' is not SHEET!ROW", raw)))?;
    let row: u32 = row
        .trim()
        .parse()
        .map_err(|_| ScheduleError::Config(format!("'{}' is not a row number", row)))?;
    if row == 0 || sheet.trim().is_empty() {
        return Err(ScheduleError::Config(format!("'{}' is not SHEET!ROW", raw)));
    }
    Ok(RowAddress::new(sheet.trim(), row))
}

/// Parse an RFC 3339 timestamp or a relative offset like `+30m`, `+2h`, `+1d`
pub fn parse_when(raw: &str, now: Timestamp) -> ScheduleResult<Timestamp> {
    let raw = raw.trim();
    if let Some(offset) = raw.strip_prefix('+') {
        let unit_at = offset.char_indices().last().map_or(0, |(i, _)| i);
        let (digits, unit) = offset.split_at(unit_at);
        let n: i64 = digits
            .parse()
            .map_err(|_| ScheduleError::Config(format!("'{}' is not a relative time", raw)))?;
        let delta = match unit {
            "s" => Duration::seconds(n),
            "m" => Duration::minutes(n),
            "h" => Duration::hours(n),
            "d" => Duration::days(n),
            _ => return Err(ScheduleError::Config(format!("'{}' is not a relative time", raw))),
        };
        return Ok(now + delta);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ScheduleError::Config(format!("'{}' is not an RFC 3339 time: {}", raw, e)))
}

/// Execute the find command
pub async fn find(
    engine: &ScheduleEngine,
    workbook: PathBuf,
    sku: String,
    spec: Option<String>,
    sheet: Option<String>,
) -> ScheduleResult<()> {
    println!("{}", "🔍 Schedule Forge - Reference lookup".bold().green());
    println!("   Workbook: {}", workbook.display());

    let mut record = OrderRecord::new(sku, spec.as_deref());
    if let Some(sheet) = sheet {
        record = record.with_target_sheet(sheet);
    }
    println!("   SKU-SPEC: {}\n", record.sku_spec.bright_yellow());

    let found = engine.find_reference(&workbook, record).await?;
    println!("{}", "✅ Reference row found".bold().green());
    println!("   Sheet: {}", found.sheet.bright_blue().bold());
    println!("   Row:   {}", found.row);
    println!("   Tier:  {}", found.tier.to_string().cyan());
    if let Some(identifier) = &found.identifier {
        println!("   Cell:  {}", identifier);
    }
    Ok(())
}

/// Execute the batch command
pub async fn batch(
    engine: &ScheduleEngine,
    workbook: PathBuf,
    orders_file: PathBuf,
    json: bool,
) -> ScheduleResult<()> {
    let records = orders::load_orders(&orders_file)?;

    if !json {
        println!("{}", "🔥 Schedule Forge - Writing orders".bold().green());
        println!("   Workbook: {}", workbook.display());
        println!("   Orders:   {} ({} records)\n", orders_file.display(), records.len());
    }

    let summary = engine.run_batch(&workbook, records).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary.results)?);
        return Ok(());
    }

    print_results(&summary.results);
    for address in &summary.suspect_rows {
        println!(
            "   {} {} may hold a partially written row; check it by hand",
            "⚠️ ".yellow(),
            address
        );
    }
    if !summary.queued.is_empty() {
        println!(
            "\n{}",
            format!("🔁 {} failed record(s) queued for retry", summary.queued.len()).yellow()
        );
        for item in &summary.queued {
            println!("   {}  {}", item.id.dimmed(), item.record.sku_spec);
        }
    }
    Ok(())
}

/// Execute the delete command
pub async fn delete(engine: &ScheduleEngine, workbook: PathBuf, rows: Vec<String>) -> ScheduleResult<()> {
    let entries = rows
        .iter()
        .map(|r| parse_row_address(r))
        .collect::<ScheduleResult<Vec<_>>>()?;

    println!("{}", "🗑  Schedule Forge - Deleting rows".bold().green());
    println!("   Workbook: {}\n", workbook.display());

    let tokens = engine.delete(&workbook, entries.clone()).await?;
    for (entry, token) in entries.iter().zip(&tokens) {
        println!("   {} {}  undo: {}", "✅".green(), entry, token.to_string().bright_blue());
    }
    Ok(())
}

/// Execute the undo command
pub async fn undo(engine: &ScheduleEngine, token: String) -> ScheduleResult<()> {
    let restored = engine.undo(&UndoToken(token)).await?;
    println!("{} Undone at {}", "↩️ ".green(), restored.to_string().bold());
    Ok(())
}

/// Execute the revert command
pub async fn revert(engine: &ScheduleEngine, token: String) -> ScheduleResult<()> {
    let removed = engine.revert_write(&UndoToken(token)).await?;
    println!("{} Order row removed from {}", "↩️ ".green(), removed.to_string().bold());
    Ok(())
}

/// Execute the evict command
pub async fn evict(engine: &ScheduleEngine, token: String) -> ScheduleResult<()> {
    engine.evict(&UndoToken(token.clone())).await?;
    println!("{} Ledger entry {} dropped", "✅".green(), token);
    Ok(())
}

/// Execute the ledger command
pub fn ledger(engine: &ScheduleEngine, workbook: PathBuf) -> ScheduleResult<()> {
    let entries = engine.ledger_entries(&workbook)?;
    println!("{}", "📒 Schedule Forge - Ledger".bold().green());
    println!("   Workbook: {}\n", workbook.display());

    if entries.deletions.is_empty() && entries.writes.is_empty() && entries.modifications.is_empty() {
        println!("   {}", "No undoable entries".dimmed());
        return Ok(());
    }
    if !entries.deletions.is_empty() {
        println!("   {}", "Deletions".bold());
        for d in &entries.deletions {
            println!(
                "      {}  {}!{} (deleted at row {})  {}",
                d.undo_token.to_string().bright_blue(),
                d.sheet,
                d.logical_row,
                d.row,
                d.timestamp.format("%Y-%m-%d %H:%M").to_string().dimmed()
            );
        }
    }
    if !entries.writes.is_empty() {
        println!("   {}", "Writes".bold());
        for w in &entries.writes {
            println!(
                "      {}  {}!{}  record {}  {}",
                w.token.to_string().bright_blue(),
                w.sheet,
                w.row,
                w.record,
                w.timestamp.format("%Y-%m-%d %H:%M").to_string().dimmed()
            );
        }
    }
    if !entries.modifications.is_empty() {
        println!("   {}", "Modifications".bold());
        for m in &entries.modifications {
            let columns: Vec<String> = m
                .cells
                .iter()
                .map(|c| identifier::column_index_to_letter(c.column))
                .collect();
            println!(
                "      {}  {}!{} [{}]  record {}  {}",
                m.token.to_string().bright_blue(),
                m.sheet,
                m.row,
                columns.join(","),
                m.record,
                m.timestamp.format("%Y-%m-%d %H:%M").to_string().dimmed()
            );
        }
    }
    Ok(())
}

/// Execute the retries command
pub fn retries(engine: &ScheduleEngine, workbook: Option<PathBuf>) -> ScheduleResult<()> {
    let items: Vec<PendingRetry> = engine
        .pending_retries()?
        .into_iter()
        .filter(|i| workbook.as_deref().map_or(true, |w| i.workbook == w))
        .collect();

    println!("{}", "🔁 Schedule Forge - Retry queue".bold().green());
    if items.is_empty() {
        println!("   {}", "Queue is empty".dimmed());
        return Ok(());
    }
    for item in &items {
        let status = match item.status {
            RetryStatus::Pending => "pending".cyan(),
            RetryStatus::Running => "running".yellow(),
            RetryStatus::Exhausted => "exhausted".red(),
        };
        let due = item
            .execute_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "manual".to_string());
        println!(
            "   {}  {:<16} {:<9} attempts {}  due {}  {}",
            item.id.dimmed(),
            item.record.sku_spec,
            status,
            item.attempt_count,
            due,
            item.workbook.display()
        );
        if let Some(reason) = &item.last_failure_reason {
            println!("      {}", reason.dimmed());
        }
    }
    Ok(())
}

/// Execute the retry command
pub async fn retry(engine: &ScheduleEngine, ids: Vec<String>) -> ScheduleResult<()> {
    let results = engine.retry_now(&ids).await?;
    print_results(&results);
    Ok(())
}

/// Execute the schedule command
pub fn schedule(engine: &ScheduleEngine, ids: Vec<String>, at: String) -> ScheduleResult<()> {
    let when = parse_when(&at, engine.retries().now())?;
    engine.schedule_retry(&ids, when)?;
    println!(
        "{} {} retr{} scheduled for {}",
        "⏱ ".green(),
        ids.len(),
        if ids.len() == 1 { "y" } else { "ies" },
        when.to_rfc3339()
    );
    Ok(())
}

/// Execute the cancel command
pub fn cancel(engine: &ScheduleEngine, id: String) -> ScheduleResult<()> {
    let item = engine.cancel_retry(&id)?;
    println!("{} Retry {} ({}) cancelled", "✅".green(), id, item.record.sku_spec);
    Ok(())
}

/// Execute the tick command
pub async fn tick(engine: &ScheduleEngine) -> ScheduleResult<()> {
    let results = engine.tick().await?;
    if results.is_empty() {
        println!("   {}", "Nothing due".dimmed());
    } else {
        print_results(&results);
    }
    Ok(())
}

fn print_results(results: &[BatchResult]) {
    let ok = results.iter().filter(|r| r.is_success()).count();
    for result in results {
        if result.is_success() {
            println!(
                "   {} {}  → {}!{} ({})",
                "✅".green(),
                result.record,
                result.matched_sheet.as_deref().unwrap_or("?"),
                result.matched_row.unwrap_or(0),
                result.tier.map(|t| t.to_string()).unwrap_or_default().dimmed()
            );
            if let Some(token) = &result.undo_token {
                println!("      undo:   {}", token.to_string().bright_blue());
            }
            if let Some(token) = &result.write_token {
                println!("      revert: {}", token.to_string().bright_blue());
            }
            for warning in &result.warnings {
                println!("      {} {}", "⚠️ ".yellow(), warning);
            }
        } else {
            println!(
                "   {} {}  {}",
                "❌".red(),
                result.record,
                result.reason.as_deref().unwrap_or("failed").red()
            );
        }
    }
    println!();
    let line = format!("{} applied, {} failed", ok, results.len() - ok);
    if ok == results.len() {
        println!("{}", line.bold().green());
    } else {
        println!("{}", line.bold().yellow());
    }
}

#[cfg(test)]
#[path = "commands_tests.rs"]
mod tests;
