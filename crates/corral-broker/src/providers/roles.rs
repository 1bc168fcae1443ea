// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-only role management SQL.
//!
//! These procedures are engine-specific, not provider-specific: every backend
//! that hosts a postgres database uses the postgres versions, every backend
//! that hosts mysql uses the mysql versions. Role grants iterate all user
//! schemata on postgres; mysql grants are database-wide.

use sqlx::{Connection, Executor, MySqlConnection, PgConnection};

use corral_store::models::{DatabaseUrl, Instance};

use super::{apply_params, random_name, random_password, ProviderError};

const PG_CREATE_GROUP: &str = r#"
do $$
    begin
        if not exists (select null from pg_roles where rolname = '$1') then
            create role $1;
        end if;
    end
$$;
"#;

const PG_CREATE_ROLE: &str = r#"
do $do$
declare sch text;
begin
  create user $1 with login encrypted password '$2';
  grant connect on database $3 to $1;
  grant $5 to $1;

  for sch in select nspname from pg_namespace where nspname not like 'pg_toast%' and nspname not like 'pg_temp%' and nspname != 'information_schema' and nspname != 'pg_catalog'
  loop
      execute format($$ grant usage on schema %I to $1 $$, sch);
      execute format($$ revoke create on schema %I from $1 $$, sch);
      execute format($$ grant select on all tables in schema %I to $1 $$, sch);
      execute format($$ grant usage, select on all sequences in schema %I to $1 $$, sch);
      execute format($$ alter default privileges for user $4 in schema %I grant select on tables to $1 $$, sch);
      execute format($$ alter default privileges for user $4 in schema %I grant select on sequences to $1 $$, sch);
  end loop;
end
$do$;
"#;

const PG_DROP_ROLE: &str = r#"
do $do$
declare sch text;
begin
  perform pg_terminate_backend(pid) from pg_stat_activity where usename = '$1';
  for sch in select nspname from pg_namespace where nspname not like 'pg_toast%' and nspname not like 'pg_temp%' and nspname != 'information_schema' and nspname != 'pg_catalog'
  loop
      execute format($$ revoke usage on schema %I from $1 $$, sch);
      execute format($$ revoke select on all tables in schema %I from $1 $$, sch);
      execute format($$ revoke usage, select on all sequences in schema %I from $1 $$, sch);
      execute format($$ alter default privileges for user $3 in schema %I revoke select on tables from $1 $$, sch);
      execute format($$ alter default privileges for user $3 in schema %I revoke select on sequences from $1 $$, sch);
  end loop;
  revoke connect on database $2 from $1;
  drop user $1;
end
$do$;
"#;

/// Group role that collects an instance's read-only users, so teardown can
/// enumerate them.
pub fn readonly_group(database_name: &str) -> String {
    format!("{database_name}_readonly_users")
}

pub async fn create_postgres_readonly_role(
    instance: &Instance,
    database_uri: &str,
) -> Result<DatabaseUrl, ProviderError> {
    if instance.engine != "postgres" {
        return Err(ProviderError::Unavailable(
            "I do not know how to do this on anything other than postgres.".to_string(),
        ));
    }

    let mut conn = PgConnection::connect(database_uri).await?;
    let group = readonly_group(&instance.name);
    conn.execute(apply_params(PG_CREATE_GROUP, &[&group]).as_str())
        .await?;

    let username = format!("rdo1{}", random_name(7));
    let password = random_password(10);
    conn.execute(
        apply_params(
            PG_CREATE_ROLE,
            &[&username, &password, &instance.name, &instance.username, &group],
        )
        .as_str(),
    )
    .await?;

    Ok(DatabaseUrl {
        username,
        password,
        endpoint: instance.endpoint.clone(),
        plan: instance.plan.id.clone(),
    })
}

pub async fn rotate_postgres_readonly_role(
    instance: &Instance,
    database_uri: &str,
    role: &str,
) -> Result<DatabaseUrl, ProviderError> {
    let mut conn = PgConnection::connect(database_uri).await?;
    let password = random_password(10);
    conn.execute(format!("alter user {role} with password '{password}'").as_str())
        .await?;
    Ok(DatabaseUrl {
        username: role.to_string(),
        password,
        endpoint: instance.endpoint.clone(),
        plan: String::new(),
    })
}

pub async fn delete_postgres_readonly_role(
    instance: &Instance,
    database_uri: &str,
    role: &str,
) -> Result<(), ProviderError> {
    let mut conn = PgConnection::connect(database_uri).await?;
    conn.execute(
        apply_params(PG_DROP_ROLE, &[role, &instance.name, &instance.username]).as_str(),
    )
    .await?;
    Ok(())
}

pub async fn create_mysql_readonly_role(
    instance: &Instance,
    database_uri: &str,
) -> Result<DatabaseUrl, ProviderError> {
    if instance.engine != "mysql" {
        return Err(ProviderError::Unavailable(
            "I do not know how to do this on anything other than mysql.".to_string(),
        ));
    }

    let username = format!("rdo1{}", random_name(7));
    let password = random_password(10);
    let mut conn = MySqlConnection::connect(database_uri).await?;
    conn.execute(format!("create user '{username}'@'%' identified by '{password}'").as_str())
        .await
        .map_err(|e| {
            ProviderError::Sql(format!(
                "Failed to create read only user for {}: {e}",
                instance.name
            ))
        })?;
    conn.execute(format!("grant select on {}.* to '{username}'", instance.name).as_str())
        .await
        .map_err(|e| {
            ProviderError::Sql(format!(
                "Failed to grant select to read only user for {}: {e}",
                instance.name
            ))
        })?;

    Ok(DatabaseUrl {
        username,
        password,
        endpoint: instance.endpoint.clone(),
        plan: instance.plan.id.clone(),
    })
}

pub async fn rotate_mysql_readonly_role(
    instance: &Instance,
    database_uri: &str,
    role: &str,
) -> Result<DatabaseUrl, ProviderError> {
    let mut conn = MySqlConnection::connect(database_uri).await?;
    let password = random_password(10);
    conn.execute(format!("alter user '{role}'@'%' identified by '{password}'").as_str())
        .await?;
    conn.execute("flush privileges").await?;
    Ok(DatabaseUrl {
        username: role.to_string(),
        password,
        endpoint: instance.endpoint.clone(),
        plan: String::new(),
    })
}

pub async fn delete_mysql_readonly_role(
    instance: &Instance,
    database_uri: &str,
    role: &str,
) -> Result<(), ProviderError> {
    let mut conn = MySqlConnection::connect(database_uri).await?;
    conn.execute(format!("revoke all privileges, grant option from '{role}'").as_str())
        .await
        .map_err(|e| {
            ProviderError::Sql(format!(
                "Failed to revoke privileges from read only user on {}: {e}",
                instance.name
            ))
        })?;
    conn.execute(format!("drop user '{role}'").as_str())
        .await
        .map_err(|e| {
            ProviderError::Sql(format!(
                "Failed to remove read only user on {}: {e}",
                instance.name
            ))
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readonly_group_is_derived_from_database_name() {
        assert_eq!(readonly_group("corraldb1"), "corraldb1_readonly_users");
    }

    #[test]
    fn create_role_template_substitutes_all_params() {
        let sql = apply_params(PG_CREATE_ROLE, &["rdo1abc", "pw", "mydb", "owner", "mydb_readonly_users"]);
        assert!(sql.contains("create user rdo1abc with login encrypted password 'pw'"));
        assert!(sql.contains("grant connect on database mydb to rdo1abc"));
        assert!(sql.contains("grant mydb_readonly_users to rdo1abc"));
        assert!(sql.contains("for user owner"));
        assert!(!sql.contains("$1"));
        assert!(!sql.contains("$5"));
    }
}
