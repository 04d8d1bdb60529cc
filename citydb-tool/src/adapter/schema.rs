//! Création du schéma et requêtes annexes de l'outil

use anyhow::{Context, Result};
use citydb_ops::FeatureRef;
use deadpool_postgres::Pool;
use tracing::{info, warn};

/// Crée le schéma, les tables et les index
///
/// Idempotent: les objets existants sont conservés sauf si `drop_existing`.
pub async fn create_schema(pool: &Pool, schema: &str, srid: u32, drop_existing: bool) -> Result<()> {
    let client = pool.get().await?;

    if drop_existing {
        client
            .execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema), &[])
            .await
            .context("Failed to drop schema")?;
    }

    client
        .execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema), &[])
        .await
        .context("Failed to create schema")?;

    // L'extension peut exister sans que l'utilisateur ait le droit de la créer
    match client
        .execute("CREATE EXTENSION IF NOT EXISTS postgis", &[])
        .await
    {
        Ok(_) => {}
        Err(e) => {
            warn!("CREATE EXTENSION postgis failed (will check if already installed): {e}");
            let exists = client
                .query_opt("SELECT 1 FROM pg_extension WHERE extname = 'postgis'", &[])
                .await
                .context("Failed to check pg_extension")?
                .is_some();
            if !exists {
                return Err(anyhow::anyhow!(
                    "PostGIS extension is not installed and could not be created: {e}"
                ));
            }
        }
    }

    let sql = format!(
        r#"
        CREATE SEQUENCE IF NOT EXISTS {schema}.feature_seq;

        CREATE TABLE IF NOT EXISTS {schema}.feature (
            id BIGINT PRIMARY KEY DEFAULT nextval('{schema}.feature_seq'),
            objectclass TEXT NOT NULL,
            objectid TEXT,
            identifier TEXT,
            envelope geometry(Polygon, {srid}),
            creation_date TIMESTAMPTZ NOT NULL DEFAULT now(),
            termination_date TIMESTAMPTZ,
            last_modification_date TIMESTAMPTZ,
            updating_person TEXT,
            reason_for_update TEXT,
            lineage TEXT,
            content JSONB
        );

        CREATE TABLE IF NOT EXISTS {schema}.property (
            id BIGSERIAL PRIMARY KEY,
            feature_id BIGINT NOT NULL REFERENCES {schema}.feature (id)
                ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
            name TEXT NOT NULL,
            val_string TEXT,
            val_double DOUBLE PRECISION,
            val_int BIGINT
        );

        CREATE TABLE IF NOT EXISTS {schema}._import_checksums (
            file_name TEXT PRIMARY KEY,
            checksum TEXT NOT NULL,
            imported_at TIMESTAMPTZ DEFAULT NOW()
        );
        "#
    );
    client
        .batch_execute(&sql)
        .await
        .context("Failed to create tables")?;

    create_indexes(&client, schema).await?;

    info!(schema, srid, "Schema ready");
    Ok(())
}

async fn create_indexes(client: &deadpool_postgres::Object, schema: &str) -> Result<()> {
    let indexes = [
        ("feature_objectid", "feature (objectid)"),
        ("feature_objectclass", "feature (objectclass)"),
        ("feature_termination", "feature (termination_date)"),
        ("feature_envelope", "feature USING GIST (envelope)"),
        ("property_feature", "property (feature_id)"),
    ];

    for (name, target) in indexes {
        client
            .execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {}.{}",
                    schema, name, schema, target
                ),
                &[],
            )
            .await
            .with_context(|| format!("Failed to create index {} on {}", name, schema))?;
    }

    Ok(())
}

/// SRID de la colonne `envelope` d'un schéma existant
pub async fn detect_srid(pool: &Pool, schema: &str) -> Result<Option<u32>> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            "SELECT srid FROM geometry_columns \
             WHERE f_table_schema = $1 AND f_table_name = 'feature' AND f_geometry_column = 'envelope'",
            &[&schema],
        )
        .await
        .context("Failed to read geometry_columns")?;

    Ok(row
        .map(|r| r.get::<_, i32>(0))
        .and_then(|srid| u32::try_from(srid).ok())
        .filter(|&srid| srid > 0))
}

/// Vérifie si un fichier a déjà été importé (checksum identique).
pub async fn is_file_already_imported(
    pool: &Pool,
    schema: &str,
    file_name: &str,
    checksum: &str,
) -> Result<bool> {
    let client = pool.get().await?;

    let row = client
        .query_opt(
            &format!(
                "SELECT 1 FROM {}._import_checksums WHERE file_name = $1 AND checksum = $2",
                schema
            ),
            &[&file_name, &checksum],
        )
        .await?;

    Ok(row.is_some())
}

/// Enregistre le checksum d'un fichier après import commité.
pub async fn record_file_checksum(
    pool: &Pool,
    schema: &str,
    file_name: &str,
    checksum: &str,
) -> Result<()> {
    let client = pool.get().await?;

    client
        .execute(
            &format!(
                r#"
                INSERT INTO {}._import_checksums (file_name, checksum)
                VALUES ($1, $2)
                ON CONFLICT (file_name) DO UPDATE SET checksum = $2, imported_at = NOW()
                "#,
                schema
            ),
            &[&file_name, &checksum],
        )
        .await
        .context("Failed to record file checksum")?;

    Ok(())
}

/// Features non terminées désignées par id ou objectid
pub async fn resolve_features(
    pool: &Pool,
    schema: &str,
    ids: &[i64],
    objectids: &[String],
) -> Result<Vec<FeatureRef>> {
    let client = pool.get().await?;

    let rows = client
        .query(
            &format!(
                "SELECT id, objectid, objectclass FROM {}.feature \
                 WHERE (id = ANY($1) OR objectid = ANY($2)) AND termination_date IS NULL \
                 ORDER BY id",
                schema
            ),
            &[&ids, &objectids],
        )
        .await
        .context("Failed to resolve features")?;

    Ok(rows
        .iter()
        .map(|row| FeatureRef {
            id: row.get(0),
            objectid: row.get(1),
            objectclass: row.get(2),
        })
        .collect())
}
