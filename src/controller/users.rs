//! Internal database users
//!
//! The operator owns three users: `operator` administers the cluster,
//! `backup` is used by pbm-agent and `monitor` by the metrics exporter.

use serde_json::{Value, json};

/// Custom role a user needs before it can be created
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CustomRole {
    pub name: &'static str,
}

impl CustomRole {
    pub fn privileges(&self) -> Value {
        match self.name {
            "pbmAnyAction" => json!([{"resource": {"anyResource": true}, "actions": ["anyAction"]}]),
            "explainRole" => json!([{
                "resource": {"db": "", "collection": ""},
                "actions": ["listIndexes", "listCollections", "dbStats", "dbHash", "collStats", "find"],
            }]),
            _ => json!([]),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MongoUser {
    pub username: &'static str,
    pub database: &'static str,
    pub roles: &'static [&'static str],
    pub custom_role: Option<CustomRole>,
}

impl MongoUser {
    /// App-scope secret key holding the user's password
    pub fn password_key(&self) -> String {
        password_key(self.username)
    }

    /// App peer data key set once the user exists
    pub fn created_flag(&self) -> String {
        format!("{}-user-created", self.username)
    }
}

pub fn password_key(username: &str) -> String {
    format!("{}-password", username)
}

pub const OPERATOR: MongoUser = MongoUser {
    username: "operator",
    database: "admin",
    roles: &["userAdminAnyDatabase", "readWriteAnyDatabase", "clusterAdmin"],
    custom_role: None,
};

pub const BACKUP: MongoUser = MongoUser {
    username: "backup",
    database: "admin",
    roles: &["readWrite", "backup", "clusterMonitor", "restore", "pbmAnyAction"],
    custom_role: Some(CustomRole {
        name: "pbmAnyAction",
    }),
};

pub const MONITOR: MongoUser = MongoUser {
    username: "monitor",
    database: "admin",
    roles: &["explainRole", "clusterMonitor"],
    custom_role: Some(CustomRole {
        name: "explainRole",
    }),
};

pub static INTERNAL_USERS: [MongoUser; 3] = [OPERATOR, BACKUP, MONITOR];

pub fn find(username: &str) -> Option<&'static MongoUser> {
    INTERNAL_USERS.iter().find(|u| u.username == username)
}

pub fn usernames() -> Vec<&'static str> {
    INTERNAL_USERS.iter().map(|u| u.username).collect()
}

/// `mongosh` command creating the operator user through the localhost
/// exception; the password is read from stdin.
pub fn create_operator_user_command(mongosh: &str) -> Vec<String> {
    let roles: Vec<Value> = OPERATOR
        .roles
        .iter()
        .map(|r| json!({"role": r, "db": OPERATOR.database}))
        .collect();
    let eval = format!(
        "db.createUser({{user: '{}', pwd: passwordPrompt(), roles: {}, \
         mechanisms: ['SCRAM-SHA-256'], passwordDigestor: 'server'}})",
        OPERATOR.username,
        Value::Array(roles)
    );
    vec![
        mongosh.to_string(),
        format!("mongodb://localhost/{}", OPERATOR.database),
        "--quiet".to_string(),
        "--eval".to_string(),
        eval,
    ]
}
