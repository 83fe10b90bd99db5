//! Privilege evaluation for source roles.
//!
//! Walks role membership transitively (role -> member-of closure) and scans
//! the effective privilege set for anything beyond the read-only baseline of
//! `SELECT` on relations, `USAGE` on schemas, and catalog reads. Anything
//! found is a violation; the operator may override with an explicit flag,
//! which still surfaces the violations in the report.

use serde::Serialize;
use sqlx::{PgPool, Row};

use crate::error::{Error, Result};

/// Recursive closure over `pg_auth_members` rooted at `current_user`.
const ROLE_TREE_CTE: &str = r#"
WITH RECURSIVE role_tree AS (
    SELECT oid AS role_oid, rolname
    FROM pg_roles
    WHERE rolname = current_user
    UNION
    SELECT m.roleid AS role_oid, r.rolname
    FROM role_tree rt
    JOIN pg_auth_members m ON m.member = rt.role_oid
    JOIN pg_roles r ON r.oid = m.roleid
)
"#;

/// One prohibited privilege held by the connected role (or an inherited one).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PrivilegeViolation {
    pub role: String,
    pub scope: String,
    pub object: String,
    pub privilege: String,
}

/// Outcome of a privilege check.
#[derive(Debug, Clone, Serialize)]
pub struct PrivilegeReport {
    pub current_user: String,
    pub inherited_roles: Vec<String>,
    pub violations: Vec<PrivilegeViolation>,
    /// Operator passed `--allow-extra-privileges`; violations are reported
    /// but do not fail the check.
    pub overridden: bool,
}

impl PrivilegeReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Error carrying the enumerated violations, for the non-override path.
    pub fn to_failure(&self) -> Error {
        let listed = self
            .violations
            .iter()
            .map(|v| format!("{}:{}:{}", v.scope, v.object, v.privilege))
            .collect::<Vec<_>>()
            .join(", ");
        Error::PrivilegeFailure(format!(
            "role '{}' holds prohibited privileges: {listed}",
            self.current_user
        ))
    }
}

fn prohibited_privilege_sql(allow_execute: bool) -> String {
    let mut chunks = vec![
        r#"
        SELECT rt.rolname::text AS role_name,
               'database'::text AS scope,
               current_database()::text AS object_name,
               p.privilege::text AS privilege
        FROM role_tree rt
        CROSS JOIN (VALUES ('CREATE'), ('TEMP')) AS p(privilege)
        WHERE has_database_privilege(rt.rolname, current_database(), p.privilege)
        "#,
        r#"
        SELECT rt.rolname::text AS role_name,
               'database'::text AS scope,
               current_database()::text AS object_name,
               'ALTER/DROP'::text AS privilege
        FROM role_tree rt
        JOIN pg_roles r ON r.rolname = rt.rolname
        JOIN pg_database d ON d.datname = current_database()
        WHERE d.datdba = r.oid
        "#,
        r#"
        SELECT rt.rolname::text AS role_name,
               'schema'::text AS scope,
               n.nspname::text AS object_name,
               'CREATE'::text AS privilege
        FROM role_tree rt
        JOIN pg_namespace n ON n.nspname !~ '^pg_' AND n.nspname <> 'information_schema'
        WHERE has_schema_privilege(rt.rolname, n.oid, 'CREATE')
        "#,
        r#"
        SELECT rt.rolname::text AS role_name,
               'schema'::text AS scope,
               n.nspname::text AS object_name,
               'ALTER/DROP'::text AS privilege
        FROM role_tree rt
        JOIN pg_roles r ON r.rolname = rt.rolname
        JOIN pg_namespace n ON n.nspowner = r.oid
        WHERE n.nspname !~ '^pg_' AND n.nspname <> 'information_schema'
        "#,
        r#"
        SELECT rt.rolname::text AS role_name,
               'table'::text AS scope,
               (n.nspname || '.' || c.relname)::text AS object_name,
               p.privilege::text AS privilege
        FROM role_tree rt
        JOIN pg_class c ON c.relkind IN ('r', 'p', 'v', 'm', 'f')
        JOIN pg_namespace n ON n.oid = c.relnamespace
        CROSS JOIN (VALUES ('INSERT'), ('UPDATE'), ('DELETE'), ('TRUNCATE'),
                           ('REFERENCES'), ('TRIGGER')) AS p(privilege)
        WHERE n.nspname !~ '^pg_'
          AND n.nspname <> 'information_schema'
          AND has_table_privilege(rt.rolname, c.oid, p.privilege)
        "#,
        r#"
        SELECT rt.rolname::text AS role_name,
               'table'::text AS scope,
               (n.nspname || '.' || c.relname)::text AS object_name,
               'ALTER/DROP'::text AS privilege
        FROM role_tree rt
        JOIN pg_roles r ON r.rolname = rt.rolname
        JOIN pg_class c ON c.relowner = r.oid AND c.relkind IN ('r', 'p', 'v', 'm', 'f')
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname !~ '^pg_'
          AND n.nspname <> 'information_schema'
        "#,
    ];

    if !allow_execute {
        chunks.push(
            r#"
            SELECT rt.rolname::text AS role_name,
                   'function'::text AS scope,
                   (n.nspname || '.' || p.proname)::text AS object_name,
                   'EXECUTE'::text AS privilege
            FROM role_tree rt
            JOIN pg_proc p ON true
            JOIN pg_namespace n ON n.oid = p.pronamespace
            WHERE n.nspname !~ '^pg_'
              AND n.nspname <> 'information_schema'
              AND has_function_privilege(rt.rolname, p.oid, 'EXECUTE')
            "#,
        );
    }

    format!(
        "{ROLE_TREE_CTE}\n{}\nORDER BY role_name, scope, object_name, privilege",
        chunks.join(" UNION ALL ")
    )
}

async fn list_inherited_roles(pool: &PgPool) -> Result<Vec<String>> {
    let rows = sqlx::query(&format!(
        "{ROLE_TREE_CTE}\nSELECT DISTINCT rolname::text AS rolname FROM role_tree ORDER BY rolname"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(|row| row.get("rolname")).collect())
}

/// Run the privilege check against a guarded source connection.
pub async fn check_privileges(
    pool: &PgPool,
    allow_execute: bool,
    overridden: bool,
) -> Result<PrivilegeReport> {
    let current_user: String = sqlx::query_scalar("SELECT current_user::text")
        .fetch_one(pool)
        .await?;
    let inherited_roles = list_inherited_roles(pool).await?;

    let rows = sqlx::query(&prohibited_privilege_sql(allow_execute))
        .fetch_all(pool)
        .await?;
    let violations = rows
        .iter()
        .map(|row| PrivilegeViolation {
            role: row.get("role_name"),
            scope: row.get("scope"),
            object: row.get("object_name"),
            privilege: row.get("privilege"),
        })
        .collect();

    Ok(PrivilegeReport {
        current_user,
        inherited_roles,
        violations,
        overridden,
    })
}

/// Human-readable report text.
pub fn format_privilege_report(report: &PrivilegeReport) -> String {
    let mut lines = Vec::new();
    lines.push(format!("Current user: {}", report.current_user));
    lines.push(format!(
        "Inherited roles: {}",
        if report.inherited_roles.is_empty() {
            "(none)".to_string()
        } else {
            report.inherited_roles.join(", ")
        }
    ));

    if report.passed() {
        lines.push("Result: PASS (no prohibited privileges detected)".to_string());
        return lines.join("\n");
    }

    if report.overridden {
        lines.push("Result: OVERRIDE (prohibited privileges allowed by operator)".to_string());
    } else {
        lines.push("Result: FAIL (prohibited privileges detected)".to_string());
    }
    lines.push("Violations:".to_string());
    for violation in &report.violations {
        lines.push(format!(
            "- role={} scope={} object={} privilege={}",
            violation.role, violation.scope, violation.object, violation.privilege
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_with(violations: Vec<PrivilegeViolation>, overridden: bool) -> PrivilegeReport {
        PrivilegeReport {
            current_user: "ro_user".to_string(),
            inherited_roles: vec!["ro_user".to_string(), "readers".to_string()],
            violations,
            overridden,
        }
    }

    fn insert_violation() -> PrivilegeViolation {
        PrivilegeViolation {
            role: "ro_user".to_string(),
            scope: "table".to_string(),
            object: "sales.orders".to_string(),
            privilege: "INSERT".to_string(),
        }
    }

    #[test]
    fn clean_report_passes() {
        let report = report_with(Vec::new(), false);
        assert!(report.passed());
        let text = format_privilege_report(&report);
        assert!(text.contains("Result: PASS"));
        assert!(text.contains("ro_user, readers"));
    }

    #[test]
    fn violations_fail_and_are_enumerated() {
        let report = report_with(vec![insert_violation()], false);
        assert!(!report.passed());
        let text = format_privilege_report(&report);
        assert!(text.contains("Result: FAIL"));
        assert!(text.contains("privilege=INSERT"));
        assert!(text.contains("object=sales.orders"));
    }

    #[test]
    fn override_is_reported_not_hidden() {
        let report = report_with(vec![insert_violation()], true);
        let text = format_privilege_report(&report);
        assert!(text.contains("Result: OVERRIDE"));
        assert!(text.contains("privilege=INSERT"));
    }

    #[test]
    fn failure_error_lists_privileges() {
        let report = report_with(vec![insert_violation()], false);
        let err = report.to_failure();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("INSERT"));
    }

    #[test]
    fn execute_probe_is_toggleable() {
        assert!(prohibited_privilege_sql(false).contains("EXECUTE"));
        assert!(!prohibited_privilege_sql(true).contains("has_function_privilege"));
    }
}
