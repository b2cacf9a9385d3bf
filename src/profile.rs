use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::schema;
use crate::settings::{SettingCheck, SettingSpec};
use crate::{AppError, AppResult};

/// The three supported persistence backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileId {
    Firebase,
    Sqlite,
    Mysql,
}

impl ProfileId {
    /// Stable listing order.
    pub const ALL: [ProfileId; 3] = [ProfileId::Firebase, ProfileId::Sqlite, ProfileId::Mysql];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileId::Firebase => "firebase",
            ProfileId::Sqlite => "sqlite",
            ProfileId::Mysql => "mysql",
        }
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileId {
    type Err = AppError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "firebase" => Ok(ProfileId::Firebase),
            "sqlite" => Ok(ProfileId::Sqlite),
            "mysql" => Ok(ProfileId::Mysql),
            _ => Err(AppError::new(
                "PROFILE/UNKNOWN",
                format!("Unknown backend profile: {input}"),
            )
            .with_context("input", input.to_string())
            .with_context("supported", "firebase, sqlite, mysql")),
        }
    }
}

/// One entry file the swap engine manages: the canonical path the
/// application loads, and the per-profile payload that should live there.
/// Both are relative to the application root.
#[derive(Debug, Clone, Copy)]
pub struct EntryFileSpec {
    pub canonical: &'static str,
    pub source: &'static str,
}

/// What "schema" means for a backend: DDL plus table names for the
/// relational profiles, an expected collection list for the document store.
#[derive(Debug, Clone, Copy)]
pub enum SchemaDescriptor {
    Sql {
        tables: &'static [&'static str],
        ddl: &'static str,
    },
    Collections {
        expected: &'static [&'static str],
    },
}

impl SchemaDescriptor {
    /// Names whose presence the connection validator checks.
    pub fn expected_names(&self) -> &'static [&'static str] {
        match self {
            SchemaDescriptor::Sql { tables, .. } => tables,
            SchemaDescriptor::Collections { expected } => expected,
        }
    }
}

/// Static description of one supported backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendProfile {
    pub id: ProfileId,
    pub display_name: &'static str,
    pub required_settings: &'static [SettingSpec],
    pub entry_files: &'static [EntryFileSpec],
    pub schema: SchemaDescriptor,
}

pub const FIREBASE_PROJECT_ID: &str = "FIREBASE_PROJECT_ID";
pub const FIREBASE_API_KEY: &str = "FIREBASE_API_KEY";
pub const SQLITE_PATH: &str = "SQLITE_PATH";
pub const MYSQL_HOST: &str = "MYSQL_HOST";
pub const MYSQL_USER: &str = "MYSQL_USER";
pub const MYSQL_PASSWORD: &str = "MYSQL_PASSWORD";
pub const MYSQL_DATABASE: &str = "MYSQL_DATABASE";

const FIREBASE_SETTINGS: &[SettingSpec] = &[
    SettingSpec {
        key: FIREBASE_PROJECT_ID,
        check: SettingCheck::Identifier,
    },
    SettingSpec {
        key: FIREBASE_API_KEY,
        check: SettingCheck::NonEmpty,
    },
];

const SQLITE_SETTINGS: &[SettingSpec] = &[SettingSpec {
    key: SQLITE_PATH,
    check: SettingCheck::PathLike,
}];

const MYSQL_SETTINGS: &[SettingSpec] = &[
    SettingSpec {
        key: MYSQL_HOST,
        check: SettingCheck::HostPort,
    },
    SettingSpec {
        key: MYSQL_USER,
        check: SettingCheck::NonEmpty,
    },
    SettingSpec {
        key: MYSQL_PASSWORD,
        check: SettingCheck::NonEmpty,
    },
    SettingSpec {
        key: MYSQL_DATABASE,
        check: SettingCheck::Identifier,
    },
];

const FIREBASE_ENTRY_FILES: &[EntryFileSpec] = &[
    EntryFileSpec {
        canonical: "main.entry",
        source: "profiles/firebase/main.entry",
    },
    EntryFileSpec {
        canonical: "pages/books.entry",
        source: "profiles/firebase/books.entry",
    },
    EntryFileSpec {
        canonical: "pages/videos.entry",
        source: "profiles/firebase/videos.entry",
    },
];

const SQLITE_ENTRY_FILES: &[EntryFileSpec] = &[
    EntryFileSpec {
        canonical: "main.entry",
        source: "profiles/sqlite/main.entry",
    },
    EntryFileSpec {
        canonical: "pages/books.entry",
        source: "profiles/sqlite/books.entry",
    },
    EntryFileSpec {
        canonical: "pages/videos.entry",
        source: "profiles/sqlite/videos.entry",
    },
];

const MYSQL_ENTRY_FILES: &[EntryFileSpec] = &[
    EntryFileSpec {
        canonical: "main.entry",
        source: "profiles/mysql/main.entry",
    },
    EntryFileSpec {
        canonical: "pages/books.entry",
        source: "profiles/mysql/books.entry",
    },
    EntryFileSpec {
        canonical: "pages/videos.entry",
        source: "profiles/mysql/videos.entry",
    },
];

const FIRESTORE_COLLECTIONS: &[&str] = &[
    "categories",
    "users",
    "books",
    "videos",
    "orders",
    "order_items",
];

static REGISTRY: Lazy<[BackendProfile; 3]> = Lazy::new(|| {
    [
        BackendProfile {
            id: ProfileId::Firebase,
            display_name: "Firebase (Firestore)",
            required_settings: FIREBASE_SETTINGS,
            entry_files: FIREBASE_ENTRY_FILES,
            schema: SchemaDescriptor::Collections {
                expected: FIRESTORE_COLLECTIONS,
            },
        },
        BackendProfile {
            id: ProfileId::Sqlite,
            display_name: "Embedded SQLite",
            required_settings: SQLITE_SETTINGS,
            entry_files: SQLITE_ENTRY_FILES,
            schema: SchemaDescriptor::Sql {
                tables: &schema::ENTITY_TABLES,
                ddl: schema::SQLITE_DDL,
            },
        },
        BackendProfile {
            id: ProfileId::Mysql,
            display_name: "Remote MySQL",
            required_settings: MYSQL_SETTINGS,
            entry_files: MYSQL_ENTRY_FILES,
            schema: SchemaDescriptor::Sql {
                tables: &schema::ENTITY_TABLES,
                ddl: schema::MYSQL_DDL,
            },
        },
    ]
});

/// Look up a profile by id. Infallible: the enum is closed.
pub fn get_profile(id: ProfileId) -> &'static BackendProfile {
    let index = match id {
        ProfileId::Firebase => 0,
        ProfileId::Sqlite => 1,
        ProfileId::Mysql => 2,
    };
    &REGISTRY[index]
}

/// Parse a user-supplied profile name and resolve it in the registry.
pub fn find_profile(input: &str) -> AppResult<&'static BackendProfile> {
    let id = ProfileId::from_str(input)?;
    Ok(get_profile(id))
}

/// All profiles in stable order `[firebase, sqlite, mysql]`.
pub fn list_profiles() -> &'static [BackendProfile] {
    &*REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_order_is_stable() {
        let ids: Vec<ProfileId> = list_profiles().iter().map(|p| p.id).collect();
        assert_eq!(
            ids,
            vec![ProfileId::Firebase, ProfileId::Sqlite, ProfileId::Mysql]
        );
    }

    #[test]
    fn find_profile_rejects_unknown_input() {
        let err = find_profile("postgres").expect_err("unsupported profile");
        assert_eq!(err.code(), "PROFILE/UNKNOWN");
        assert_eq!(err.context().get("input"), Some(&"postgres".to_string()));
    }

    #[test]
    fn find_profile_is_case_insensitive() {
        assert_eq!(find_profile("MySQL").unwrap().id, ProfileId::Mysql);
        assert_eq!(find_profile(" sqlite ").unwrap().id, ProfileId::Sqlite);
    }

    #[test]
    fn profile_id_serializes_lowercase() {
        let json = serde_json::to_string(&ProfileId::Firebase).unwrap();
        assert_eq!(json, "\"firebase\"");
        let back: ProfileId = serde_json::from_str("\"mysql\"").unwrap();
        assert_eq!(back, ProfileId::Mysql);
    }

    #[test]
    fn every_profile_shares_the_canonical_entry_set() {
        let canonical: Vec<&str> = get_profile(ProfileId::Sqlite)
            .entry_files
            .iter()
            .map(|f| f.canonical)
            .collect();
        for profile in list_profiles() {
            let other: Vec<&str> = profile.entry_files.iter().map(|f| f.canonical).collect();
            assert_eq!(canonical, other, "entry set differs for {}", profile.id);
        }
    }

    #[test]
    fn sql_profiles_expose_entity_tables() {
        for id in [ProfileId::Sqlite, ProfileId::Mysql] {
            let profile = get_profile(id);
            assert_eq!(profile.schema.expected_names(), &schema::ENTITY_TABLES);
        }
    }
}
