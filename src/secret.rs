//! The secret tree: folders, items and fields, exactly as they travel in
//! the common-section JSON. A field flagged `secret` keeps its value
//! AES-enciphered under the database's secret key and the owning item's IV,
//! so opening the common tier alone never exposes it.
//!
//! Tree nodes carry no back-references; operations that need key material
//! receive it from the database.

use memsec::memzero;

use b64;
use crypto::CryptoProvider;
use error::{Error, Result};

/// Highest id a folder or item may take; the allocator scans upwards from 1.
pub const MAX_SECRET_ID: u32 = 100_000;

/// "true"/"false" string booleans, the historical wire form. Native JSON
/// booleans are accepted on input; the string form is always emitted.
mod string_bool {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "true" } else { "false" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        struct BoolVisitor;

        impl<'de> Visitor<'de> for BoolVisitor {
            type Value = bool;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"true\", \"false\" or a boolean")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<bool, E> {
                Ok(v)
            }

            // Anything but the literal "true" reads as false.
            fn visit_str<E: de::Error>(self, v: &str) -> Result<bool, E> {
                Ok(v == "true")
            }
        }

        deserializer.deserialize_any(BoolVisitor)
    }
}

/// A 16-byte IV as base-64 in the JSON.
mod b64_iv {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    use b64;

    pub fn serialize<S: Serializer>(iv: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&b64::encode(iv))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 16], D::Error> {
        struct IvVisitor;

        impl<'de> Visitor<'de> for IvVisitor {
            type Value = [u8; 16];

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a base-64 encoded 16-byte initialisation vector")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<[u8; 16], E> {
                let mut iv = [0u8; 16];
                let len = b64::decode(&mut iv, v).map_err(de::Error::custom)?;
                if len != 16 {
                    return Err(de::Error::custom("decoded AES IV is not 16 bytes long"));
                }
                Ok(iv)
            }
        }

        deserializer.deserialize_str(IvVisitor)
    }
}

/// What a field read yields at the caller's unlock level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    /// The field exists but holds no value.
    Empty,
    /// The cleartext.
    Plain(String),
    /// The field is secret-tier and the secret key is not available.
    Locked,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SecretField {
    pub field_name: String,
    #[serde(with = "string_bool", default)]
    pub secret: bool,
    // Reserved for the session-key mechanism; carried through untouched.
    #[serde(with = "string_bool", default)]
    pub piggy_banked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

impl SecretField {
    pub fn new(field_name: &str) -> SecretField {
        SecretField {
            field_name: field_name.to_string(),
            secret: false,
            piggy_banked: false,
            value: None,
            session_key: None,
        }
    }

    /// Sets the field value. A secret-tier field is padded with its NUL
    /// terminator and random bytes to a whole AES block count, enciphered
    /// under (secret_key, aes_iv) and stored as base-64.
    ///
    /// # Errors
    ///
    /// `Error::WrongLevel` when the field is secret and no secret key is
    /// available.
    pub fn update(
        &mut self,
        value: &str,
        crypto: &mut dyn CryptoProvider,
        secret_key: Option<&[u8; 32]>,
        aes_iv: &[u8; 16],
    ) -> Result<()> {
        if self.secret {
            let key = secret_key.ok_or(Error::WrongLevel)?;
            let aes_len = (value.len() + 1 + 15) & !15;
            let mut buf = vec![0u8; aes_len];
            crypto.random_fill(&mut buf)?;
            buf[..value.len()].copy_from_slice(value.as_bytes());
            buf[value.len()] = 0;
            crypto.aes256_cbc(&mut buf, key, aes_iv, true)?;
            self.value = Some(b64::encode(&buf));
        } else {
            self.value = Some(value.to_string());
        }
        Ok(())
    }

    /// Reads the field value at the caller's level. Secret fields without
    /// the key come back `Locked`, never as ciphertext.
    pub fn reveal(
        &self,
        crypto: &dyn CryptoProvider,
        secret_key: Option<&[u8; 32]>,
        aes_iv: &[u8; 16],
    ) -> Result<FieldValue> {
        let value = match self.value {
            Some(ref v) => v,
            None => return Ok(FieldValue::Empty),
        };
        if !self.secret {
            return Ok(FieldValue::Plain(value.clone()));
        }
        let key = match secret_key {
            Some(k) => k,
            None => return Ok(FieldValue::Locked),
        };

        let mut buf = b64::decode_vec(value)?;
        if buf.is_empty() || buf.len() % 16 != 0 {
            return Err(Error::IntegrityFail(
                "enciphered field is not a whole number of blocks",
            ));
        }
        crypto.aes256_cbc(&mut buf, key, aes_iv, false)?;
        let end = match buf.iter().position(|&b| b == 0) {
            Some(end) => end,
            None => {
                unsafe {
                    memzero(buf.as_mut_ptr(), buf.len());
                }
                return Err(Error::IntegrityFail("enciphered field has no terminator"));
            }
        };
        let clear = match ::std::str::from_utf8(&buf[..end]) {
            Ok(s) => s.to_string(),
            Err(_) => {
                unsafe {
                    memzero(buf.as_mut_ptr(), buf.len());
                }
                return Err(Error::IntegrityFail("deciphered field is not UTF-8"));
            }
        };
        unsafe {
            memzero(buf.as_mut_ptr(), buf.len());
        }
        Ok(FieldValue::Plain(clear))
    }

    /// Moves the field to the secret tier, enciphering the current value.
    pub fn set_secret(
        &mut self,
        crypto: &mut dyn CryptoProvider,
        secret_key: &[u8; 32],
        aes_iv: &[u8; 16],
    ) -> Result<()> {
        if self.secret {
            return Ok(());
        }
        let clear = match self.value.take() {
            Some(v) => v,
            None => return Err(Error::InvalidArg("field has no value".into())),
        };
        self.secret = true;
        self.update(&clear, crypto, Some(secret_key), aes_iv)
    }

    /// Moves the field back to the common tier, storing the cleartext.
    pub fn set_common(
        &mut self,
        crypto: &mut dyn CryptoProvider,
        secret_key: &[u8; 32],
        aes_iv: &[u8; 16],
    ) -> Result<()> {
        if !self.secret {
            return Ok(());
        }
        match self.reveal(crypto, Some(secret_key), aes_iv)? {
            FieldValue::Plain(clear) => {
                self.secret = false;
                self.value = Some(clear);
            }
            FieldValue::Empty => {
                self.secret = false;
                self.value = None;
            }
            FieldValue::Locked => unreachable!("key was supplied"),
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SecretItem {
    pub title: String,
    pub id: u32,
    #[serde(default)]
    pub fields: Vec<SecretField>,
    /// Initialisation vector shared by every enciphered field of this item.
    #[serde(with = "b64_iv")]
    pub aes_iv: [u8; 16],
}

impl SecretItem {
    pub fn new(title: &str, id: u32, crypto: &mut dyn CryptoProvider) -> Result<SecretItem> {
        let mut aes_iv = [0u8; 16];
        crypto.random_fill(&mut aes_iv)?;
        Ok(SecretItem {
            title: title.to_string(),
            id,
            fields: Vec::new(),
            aes_iv,
        })
    }

    pub fn field(&self, name: &str) -> Option<&SecretField> {
        self.fields.iter().find(|f| f.field_name == name)
    }

    pub fn field_exists(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Updates an existing field or appends a new common-tier one.
    pub fn update_field(
        &mut self,
        name: &str,
        value: &str,
        crypto: &mut dyn CryptoProvider,
        secret_key: Option<&[u8; 32]>,
    ) -> Result<()> {
        let aes_iv = self.aes_iv;
        if let Some(field) = self.fields.iter_mut().find(|f| f.field_name == name) {
            return field.update(value, crypto, secret_key, &aes_iv);
        }
        let mut field = SecretField::new(name);
        field.update(value, crypto, secret_key, &aes_iv)?;
        self.fields.push(field);
        Ok(())
    }

    pub fn delete_field(&mut self, name: &str) -> bool {
        match self.fields.iter().position(|f| f.field_name == name) {
            Some(i) => {
                self.fields.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn field_value(
        &self,
        name: &str,
        crypto: &dyn CryptoProvider,
        secret_key: Option<&[u8; 32]>,
    ) -> Result<FieldValue> {
        let field = self
            .field(name)
            .ok_or_else(|| Error::InvalidArg(format!("no field '{}'", name)))?;
        field.reveal(crypto, secret_key, &self.aes_iv)
    }

    pub fn set_field_secret(
        &mut self,
        name: &str,
        crypto: &mut dyn CryptoProvider,
        secret_key: &[u8; 32],
    ) -> Result<()> {
        let aes_iv = self.aes_iv;
        let field = self
            .fields
            .iter_mut()
            .find(|f| f.field_name == name)
            .ok_or_else(|| Error::InvalidArg(format!("no field '{}'", name)))?;
        field.set_secret(crypto, secret_key, &aes_iv)
    }

    pub fn set_field_common(
        &mut self,
        name: &str,
        crypto: &mut dyn CryptoProvider,
        secret_key: &[u8; 32],
    ) -> Result<()> {
        let aes_iv = self.aes_iv;
        let field = self
            .fields
            .iter_mut()
            .find(|f| f.field_name == name)
            .ok_or_else(|| Error::InvalidArg(format!("no field '{}'", name)))?;
        field.set_common(crypto, secret_key, &aes_iv)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SecretFolder {
    pub title: String,
    pub id: u32,
    #[serde(default)]
    pub secrets: Vec<SecretItem>,
    #[serde(default)]
    pub sub_folders: Vec<SecretFolder>,
}

impl SecretFolder {
    pub fn new(title: &str, id: u32) -> SecretFolder {
        SecretFolder {
            title: title.to_string(),
            id,
            secrets: Vec::new(),
            sub_folders: Vec::new(),
        }
    }

    /// Finds a folder anywhere under (and including) this one.
    pub fn find_folder(&self, id: u32) -> Option<&SecretFolder> {
        if self.id == id {
            return Some(self);
        }
        self.sub_folders.iter().filter_map(|f| f.find_folder(id)).next()
    }

    pub fn find_folder_mut(&mut self, id: u32) -> Option<&mut SecretFolder> {
        if self.id == id {
            return Some(self);
        }
        for sub in self.sub_folders.iter_mut() {
            if let Some(found) = sub.find_folder_mut(id) {
                return Some(found);
            }
        }
        None
    }

    /// A direct child item of this folder.
    pub fn secret_by_id(&self, id: u32) -> Option<&SecretItem> {
        self.secrets.iter().find(|s| s.id == id)
    }

    pub fn secret_by_id_mut(&mut self, id: u32) -> Option<&mut SecretItem> {
        self.secrets.iter_mut().find(|s| s.id == id)
    }

    /// A direct child folder of this folder.
    pub fn sub_folder_by_id(&self, id: u32) -> Option<&SecretFolder> {
        self.sub_folders.iter().find(|f| f.id == id)
    }

    pub fn add_sub_folder(&mut self, folder: SecretFolder) {
        self.sub_folders.push(folder);
    }

    pub fn add_secret_item(&mut self, item: SecretItem) {
        self.secrets.push(item);
    }

    pub fn delete_secret_item(&mut self, id: u32) -> bool {
        match self.secrets.iter().position(|s| s.id == id) {
            Some(i) => {
                self.secrets.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn delete_sub_folder(&mut self, id: u32) -> bool {
        match self.sub_folders.iter().position(|f| f.id == id) {
            Some(i) => {
                self.sub_folders.remove(i);
                true
            }
            None => false,
        }
    }

    /// Whether `id` is taken nowhere in this subtree.
    pub fn is_id_free(&self, id: u32) -> bool {
        if self.id == id {
            return false;
        }
        if self.secrets.iter().any(|s| s.id == id) {
            return false;
        }
        self.sub_folders.iter().all(|f| f.is_id_free(id))
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty() && self.sub_folders.is_empty()
    }
}

/// The smallest free id in the tree, ids being recycled after deletions.
pub fn free_id(root: &SecretFolder) -> Option<u32> {
    (1..MAX_SECRET_ID).find(|&id| root.is_id_free(id))
}

/// Slash-separated folder titles from the root down to folder `id`.
pub fn title_path(root: &SecretFolder, id: u32) -> Option<String> {
    fn walk(folder: &SecretFolder, id: u32, trail: &mut Vec<String>) -> bool {
        trail.push(folder.title.clone());
        if folder.id == id {
            return true;
        }
        for sub in folder.sub_folders.iter() {
            if walk(sub, id, trail) {
                return true;
            }
        }
        trail.pop();
        false
    }

    let mut trail = Vec::new();
    if walk(root, id, &mut trail) {
        Some(trail.join("/"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::OsCrypto;
    use serde_json;

    #[test]
    fn test_string_bool_forms() {
        let field: SecretField =
            serde_json::from_str(r#"{"field_name": "a", "secret": "true", "piggy_banked": "false"}"#)
                .expect("parse");
        assert!(field.secret);
        assert!(!field.piggy_banked);

        // Native booleans are accepted on input.
        let field: SecretField =
            serde_json::from_str(r#"{"field_name": "a", "secret": true, "piggy_banked": false}"#)
                .expect("parse");
        assert!(field.secret);

        // Missing keys default to false, unknown strings read as false.
        let field: SecretField =
            serde_json::from_str(r#"{"field_name": "a", "secret": "yes"}"#).expect("parse");
        assert!(!field.secret);
        assert!(!field.piggy_banked);

        // The string form is what goes out.
        let text = serde_json::to_string(&field).expect("emit");
        assert!(text.contains(r#""secret":"false""#));
        assert!(text.contains(r#""piggy_banked":"false""#));
        assert!(!text.contains("value"));
    }

    #[test]
    fn test_item_iv_round_trips_as_base64() {
        let mut crypto = OsCrypto::new().expect("rng");
        let item = SecretItem::new("login", 2, &mut crypto).expect("item");
        let text = serde_json::to_string(&item).expect("emit");
        let back: SecretItem = serde_json::from_str(&text).expect("parse");
        assert_eq!(back.aes_iv, item.aes_iv);
        assert_eq!(back.title, "login");
    }

    #[test]
    fn test_secret_field_conceals_and_reveals() {
        let mut crypto = OsCrypto::new().expect("rng");
        let key = [0x5au8; 32];
        let mut item = SecretItem::new("login", 2, &mut crypto).expect("item");
        item.update_field("user", "alice", &mut crypto, Some(&key))
            .expect("update");
        item.update_field("pwd", "hunter2", &mut crypto, Some(&key))
            .expect("update");
        item.set_field_secret("pwd", &mut crypto, &key).expect("secret");

        // The stored form is base-64 ciphertext, not the cleartext.
        let stored = item.field("pwd").unwrap().value.clone().unwrap();
        assert_ne!(stored, "hunter2");
        assert_eq!(b64::decode_vec(&stored).expect("b64").len() % 16, 0);

        // With the key the cleartext comes back; without it the field is
        // locked, and the ciphertext is never returned.
        assert_eq!(
            item.field_value("pwd", &crypto, Some(&key)).expect("read"),
            FieldValue::Plain("hunter2".to_string())
        );
        assert_eq!(
            item.field_value("pwd", &crypto, None).expect("read"),
            FieldValue::Locked
        );
        assert_eq!(
            item.field_value("user", &crypto, None).expect("read"),
            FieldValue::Plain("alice".to_string())
        );

        // Demotion restores the cleartext form.
        item.set_field_common("pwd", &mut crypto, &key).expect("common");
        assert_eq!(
            item.field("pwd").unwrap().value.clone().unwrap(),
            "hunter2"
        );
    }

    #[test]
    fn test_updating_secret_field_needs_the_key() {
        let mut crypto = OsCrypto::new().expect("rng");
        let key = [9u8; 32];
        let mut item = SecretItem::new("login", 2, &mut crypto).expect("item");
        item.update_field("pwd", "one", &mut crypto, Some(&key))
            .expect("update");
        item.set_field_secret("pwd", &mut crypto, &key).expect("secret");
        assert!(item.update_field("pwd", "two", &mut crypto, None).is_err());
    }

    #[test]
    fn test_id_allocation_recycles() {
        let mut crypto = OsCrypto::new().expect("rng");
        let mut root = SecretFolder::new("root", 1);
        assert_eq!(free_id(&root), Some(2));
        root.add_secret_item(SecretItem::new("a", 2, &mut crypto).expect("item"));
        let mut sub = SecretFolder::new("sub", 3);
        sub.add_secret_item(SecretItem::new("b", 4, &mut crypto).expect("item"));
        root.add_sub_folder(sub);
        assert_eq!(free_id(&root), Some(5));

        root.delete_secret_item(2);
        assert_eq!(free_id(&root), Some(2));
        assert!(root.is_id_free(2));
        assert!(!root.is_id_free(4));
    }

    #[test]
    fn test_title_path() {
        let mut root = SecretFolder::new("root", 1);
        let mut a = SecretFolder::new("mail", 2);
        a.add_sub_folder(SecretFolder::new("work", 3));
        root.add_sub_folder(a);
        assert_eq!(title_path(&root, 3).unwrap(), "root/mail/work");
        assert_eq!(title_path(&root, 1).unwrap(), "root");
        assert!(title_path(&root, 9).is_none());
    }
}
