use super::{CompiledQuery, derived_table, sanitized_column};
use crate::dialect::Dialect;
use crate::errors::ConfigError;

/// `SELECT DISTINCT c FROM (base) AS base_data ORDER BY c` for a sanitized column name.
pub fn compile_distinct(base_query: &str, column: &str, dialect: Dialect) -> Result<CompiledQuery, ConfigError> {
    let column_sql =
        sanitized_column(column, dialect).ok_or_else(|| ConfigError::invalid(format!("Invalid column name '{column}'")))?;

    Ok(CompiledQuery::raw(format!(
        "SELECT DISTINCT {column_sql} FROM {} ORDER BY {column_sql}",
        derived_table(base_query)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct() {
        let compiled = compile_distinct("SELECT * FROM t", "Region", Dialect::MsSql).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT DISTINCT [Region] FROM (SELECT * FROM t) AS base_data ORDER BY [Region]"
        );
    }

    #[test]
    fn test_distinct_sanitizes() {
        let compiled = compile_distinct("SELECT * FROM t", "Reg-ion", Dialect::Postgres).unwrap();
        assert!(compiled.sql.starts_with("SELECT DISTINCT \"Region\""));
        assert!(compile_distinct("SELECT * FROM t", "--", Dialect::Postgres).is_err());
    }
}
