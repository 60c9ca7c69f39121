use anyhow::Result;
use sessionizer::config::Config;
use sessionizer::warehouse::{clickhouse_mapper, create_table_statement, map_schema, session_schema};

/// Execute the columns command
///
/// Prints the `CREATE TABLE` statement the warehouse closer issues.
pub fn execute(cfg: &Config) -> Result<()> {
    println!("{}", table_statement(&cfg.warehouse.table)?);
    Ok(())
}

fn table_statement(table: &str) -> Result<String> {
    let columns = map_schema(&clickhouse_mapper(), &session_schema())?;
    Ok(create_table_statement(table, &columns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_statement() {
        let sql = table_statement("events").unwrap();

        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS events"));
        assert!(sql.contains("user_id String DEFAULT ''"));
        assert!(sql.contains("params Nested(key String, value String)"));
    }
}
