//! Basic usage example for `KasaDB`.

use kasadb::prelude::*;
use kasadb_key_file::FileKeyProvider;
use serde_json::json;
use std::path::PathBuf;

fn attrs(value: serde_json::Value) -> Attributes {
    match value {
        serde_json::Value::Object(map) => normalize(map),
        _ => Attributes::new(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("KasaDB Basic Usage Example");
    println!("==========================\n");

    let dir = PathBuf::from("./example_data");
    std::fs::create_dir_all(&dir)?;

    let key_path = dir.join("master.key");
    let provider = if key_path.exists() {
        FileKeyProvider::new(&key_path)?
    } else {
        println!("Writing master key to {}...", key_path.display());
        FileKeyProvider::init(&key_path)?
    };
    println!("✓ FileKeyProvider ready\n");

    let db = Database::open(DatabaseConfig::new(dir.join("kasadb.sqlite3")))?;
    let keys = KeyManager::from_provider(&provider, db.clone(), KeyManagerConfig::default())?;

    let index = BlindIndex::new(keys.clone(), db.clone());
    let store = Store::new(keys.clone(), db)
        .with_validator(CredentialsValidator::default())
        .with_indexer(FieldIndexer::new(index.clone()).unique("user", IndexScope::Parent, &["email"]));
    println!("✓ Store opened\n");

    // A domain is a root entity: its parent is its own uuid.
    let domain = Identifier::new_v4();
    store
        .insert_with_uuid(domain, "domain", &domain.to_string(), attrs(json!({"name": "example.org"})))
        .await?;
    println!("✓ Domain {domain} created");

    let user = store
        .insert("user", &domain.to_string(), attrs(json!({"email": "alice@example.org"})))
        .await?;
    println!("✓ User {} created", user.uuid());

    let duplicate = store
        .insert("user", &domain.to_string(), attrs(json!({"email": "alice@example.org"})))
        .await;
    if let Err(Error::IndexConflict { conflicts, .. }) = duplicate {
        println!("✓ Duplicate email rejected (owned by {})", conflicts["email"]);
    }

    let found = index.find(Some(&domain.to_string()), "email", &json!("alice@example.org")).await?;
    println!("✓ Blind index lookup: {found:?}\n");

    store
        .insert("credentials", &user.uuid().to_string(), attrs(json!({"password": "correct horse"})))
        .await?;
    let credentials = store.by_parent(&user.uuid().to_string(), Some("credentials"), false).await?;
    for entity in credentials.values() {
        let record = CredentialRecord::from_attributes(entity.attributes().await?)?;
        println!("✓ Credentials stored ({}, {} iterations)", record.kdf_spec.hash, record.kdf_spec.iterations);
        println!("  - verify(\"correct horse\") = {}", record.verify("correct horse")?);
        println!("  - verify(\"battery staple\") = {}\n", record.verify("battery staple")?);
    }

    // Rotate: retire the key in use, new writes pick up a fresh one.
    keys.delete(&user.encryption_key_id()).await?;
    let updated = store
        .update(&user.uuid().to_string(), attrs(json!({"displayName": "Alice"})))
        .await?
        .ok_or("user vanished")?;
    println!("✓ Key rotated: {} -> {}", user.encryption_key_id(), updated.encryption_key_id());
    println!("  - attributes: {}", serde_json::Value::Object(updated.attributes().await?.clone()));

    let stats = keys.stats();
    println!("\nKeys: {} valid, {} retired", stats.valid, stats.deleted);

    Ok(())
}
