//! Position export: one GBK CSV per account per day, one row per non-zero
//! leg, written to the account's export directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;

use qt_types::{Position, Symbol};

const EXPORT_HEADER: [&str; 6] = ["账户", "交易日期", "合约代码", "方向", "今仓", "昨仓"];

/// Write `position-<account_id>-<YYYYMMDD>.csv`. Returns the file path, or
/// `None` when there is nothing to export.
pub fn export_positions(
    account_id: &str,
    export_dir: &Path,
    positions: &HashMap<Symbol, Position>,
) -> std::io::Result<Option<PathBuf>> {
    let live: Vec<&Position> = positions.values().filter(|p| !p.is_flat()).collect();
    if live.is_empty() {
        info!(account_id, "no positions, skipping export");
        return Ok(None);
    }

    std::fs::create_dir_all(export_dir)?;
    let today = Local::now().format("%Y%m%d").to_string();
    let file_path = export_dir.join(format!("position-{account_id}-{today}.csv"));

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(EXPORT_HEADER)
        .map_err(csv_to_io)?;
    let mut sorted = live;
    sorted.sort_by_key(|p| p.symbol.to_string());
    for position in sorted {
        if position.pos_long > 0 {
            writer
                .write_record([
                    account_id,
                    &today,
                    &position.symbol.to_string(),
                    "多",
                    &position.pos_long_td.to_string(),
                    &position.pos_long_yd.to_string(),
                ])
                .map_err(csv_to_io)?;
        }
        if position.pos_short > 0 {
            writer
                .write_record([
                    account_id,
                    &today,
                    &position.symbol.to_string(),
                    "空",
                    &position.pos_short_td.to_string(),
                    &position.pos_short_yd.to_string(),
                ])
                .map_err(csv_to_io)?;
        }
    }
    let utf8 = writer.into_inner().map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
    })?;

    let (gbk, _, _) = encoding_rs::GBK.encode(std::str::from_utf8(&utf8).expect("csv is utf-8"));
    std::fs::write(&file_path, gbk)?;
    info!(account_id, path = %file_path.display(), "positions exported");
    Ok(Some(file_path))
}

fn csv_to_io(e: csv::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(symbol: &str, pos_long: i64, pos_short: i64) -> Position {
        let mut p = Position::flat(symbol.parse().unwrap());
        p.pos_long = pos_long;
        p.pos_long_td = pos_long;
        p.pos_short = pos_short;
        p.pos_short_td = pos_short;
        p
    }

    #[test]
    fn exports_one_row_per_leg() {
        let dir = tempfile::tempdir().unwrap();
        let mut positions = HashMap::new();
        positions.insert("SHFE.rb2505".parse().unwrap(), position("SHFE.rb2505", 3, 2));
        positions.insert("DCE.i2505".parse().unwrap(), position("DCE.i2505", 0, 0));

        let path = export_positions("ACC", dir.path(), &positions)
            .unwrap()
            .unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("position-ACC-"));

        let bytes = std::fs::read(&path).unwrap();
        let (text, _, _) = encoding_rs::GBK.decode(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3); // header + long leg + short leg
        assert!(lines[0].contains("账户"));
        assert!(lines[1].contains("多"));
        assert!(lines[2].contains("空"));
    }

    #[test]
    fn flat_book_skips_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut positions = HashMap::new();
        positions.insert("DCE.i2505".parse().unwrap(), position("DCE.i2505", 0, 0));
        assert!(export_positions("ACC", dir.path(), &positions)
            .unwrap()
            .is_none());
    }
}
