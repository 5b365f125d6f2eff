//! The semantics behind each CLI command. The parser, colors and terminal
//! handling live outside; this layer owns the dialogue logic (prompts,
//! confirmations, level gates) and speaks only through the `Console` trait
//! and the message catalogue.

use std::path::Path;

use memsec::memzero;

use crypto::OsCrypto;
use database::{Database, Level};
use error::{Error, Result};
use holder::ChunkStatus;
use msg::{fill, msg, MsgId};
use secret::FieldValue;
use ui::{ColorCode, Console};

/// Default common threshold for `init`.
pub const DEFAULT_COMMON_THRESHOLD: u16 = 2;
/// Default secret threshold for `init`.
pub const DEFAULT_SECRET_THRESHOLD: u16 = 3;
/// Default length of generated field values; 62 symbols at this length
/// carry about 128 bits of entropy.
pub const DEFAULT_GENERATED_LENGTH: usize = 22;

fn wipe_string(s: &mut String) {
    unsafe {
        let v = s.as_mut_vec();
        memzero(v.as_mut_ptr(), v.len());
    }
}

/// One interactive session: at most one database open at a time.
pub struct Session {
    db: Option<Database>,
}

impl Session {
    pub fn new() -> Session {
        Session { db: None }
    }

    pub fn database(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    pub fn database_mut(&mut self) -> Option<&mut Database> {
        self.db.as_mut()
    }

    fn complain_no_db(console: &mut dyn Console) -> Error {
        console.print_color(ColorCode::Error);
        console.print(msg(MsgId::ErrorNoDb));
        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::ErrorNoDb2));
        console.print_color(ColorCode::Input);
        Error::NoDatabase
    }

    fn complain_not_secret(console: &mut dyn Console) -> Error {
        console.print_color(ColorCode::Error);
        console.print(msg(MsgId::ErrorScolon));
        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::NewHolderNotSecret));
        console.print_color(ColorCode::Input);
        Error::WrongLevel
    }

    fn complain_invalid_id(console: &mut dyn Console) -> Error {
        console.print_color(ColorCode::Error);
        console.print(msg(MsgId::InvalidId));
        console.print_color(ColorCode::Input);
        Error::InvalidArg("bad id".into())
    }

    /// `init [file FN] [common parts N] [secret parts N]`
    pub fn init(
        &mut self,
        console: &mut dyn Console,
        file: Option<&Path>,
        common_threshold: Option<u16>,
        secret_threshold: Option<u16>,
    ) -> Result<()> {
        if self.db.is_some() {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::InitFile1));
            console.print_color(ColorCode::Output);
            console.print(msg(MsgId::InitFile2));
            console.print_color(ColorCode::Input);
            return Err(Error::InvalidArg("a database is already open".into()));
        }
        let common = common_threshold.unwrap_or(DEFAULT_COMMON_THRESHOLD);
        let secret = secret_threshold.unwrap_or(DEFAULT_SECRET_THRESHOLD);
        let db = Database::create(common, secret, file, Box::new(OsCrypto::new()?))?;

        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::InitFile3));
        console.print(msg(MsgId::InitFile4));
        console.print_color(ColorCode::Value);
        match file {
            Some(f) => console.print(&format!("{}\n", f.display())),
            None => console.print(msg(MsgId::InitFile5)),
        }
        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::InitFile6));
        console.print_color(ColorCode::Value);
        console.print(&format!("{}\n", common));
        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::InitFile7));
        console.print_color(ColorCode::Value);
        console.print(&format!("{}\n", secret));
        console.print_color(ColorCode::Input);

        console.prompt_set(&db.prompt());
        self.db = Some(db);
        Ok(())
    }

    /// `load FN`
    pub fn load(&mut self, console: &mut dyn Console, file: &Path) -> Result<()> {
        if self.db.is_some() {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::ErrDbAlready));
            console.print_color(ColorCode::Output);
            console.print(msg(MsgId::ErrDbAlready2));
            console.print_color(ColorCode::Input);
            return Err(Error::InvalidArg("a database is already open".into()));
        }
        match Database::open(file, Box::new(OsCrypto::new()?)) {
            Ok(db) => {
                console.print(msg(MsgId::FirstOk));
                console.prompt_set(&db.prompt());
                self.db = Some(db);
                Ok(())
            }
            Err(e) => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::ErrorScolon));
                console.print_color(ColorCode::Output);
                console.print(msg(MsgId::ErrOpenFile));
                console.print_color(ColorCode::Input);
                Err(e)
            }
        }
    }

    /// `try NICK`: prompts for the password and runs one state-machine
    /// step.
    pub fn try_holder(&mut self, console: &mut dyn Console, nickname: &str) -> Result<()> {
        if self.db.is_none() {
            return Err(Self::complain_no_db(console));
        }
        console.print(&fill(msg(MsgId::GivePwd), &[nickname]));
        let mut password = console.read_line(true);
        let outcome = self
            .db
            .as_mut()
            .unwrap()
            .try_holder(nickname, &password);
        wipe_string(&mut password);

        let db = self.db.as_ref().unwrap();
        match outcome {
            Ok((common, secret)) => {
                console.print(&fill(
                    msg(MsgId::TryOk),
                    &[nickname, &common.to_string(), &secret.to_string()],
                ));
                console.prompt_set(&db.prompt());
                Ok(())
            }
            Err(Error::TryNotFound) => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::ErrorScolon));
                console.print_color(ColorCode::Output);
                console.print(msg(MsgId::TryNok1));
                console.print_color(ColorCode::Input);
                Err(Error::TryNotFound)
            }
            Err(Error::TryAlreadyOpen) => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::ErrorScolon));
                console.print_color(ColorCode::Output);
                console.print(&fill(msg(MsgId::TryNokAlready), &[nickname]));
                console.print_color(ColorCode::Input);
                Err(Error::TryAlreadyOpen)
            }
            Err(Error::TryInconsistent) => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::ErrorScolon));
                console.print_color(ColorCode::Output);
                console.print(msg(MsgId::TryNokInconsistent));
                console.print_color(ColorCode::Input);
                Err(Error::TryInconsistent)
            }
            Err(e) => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::ErrorScolon));
                console.print_color(ColorCode::Output);
                console.print(&format!("{}\n", e));
                console.print_color(ColorCode::Input);
                Err(e)
            }
        }
    }

    /// `save [FN]`: refuses to write a file that could never be reopened.
    pub fn save(&mut self, console: &mut dyn Console, file: Option<&Path>) -> Result<()> {
        let db = match self.db {
            Some(ref mut db) => db,
            None => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::InitSave1));
                console.print_color(ColorCode::Output);
                console.print(msg(MsgId::InitSave2));
                console.print_color(ColorCode::Input);
                return Err(Error::NoDatabase);
            }
        };
        if file.is_none() && db.filename().is_none() {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::InitSave3));
            console.print_color(ColorCode::Output);
            console.print(msg(MsgId::InitSave4));
            console.print_color(ColorCode::Input);
            return Err(Error::InvalidArg("no file name".into()));
        }

        match db.save(file) {
            Ok(()) => {
                // Warn when the distribution only just covers the
                // thresholds: losing a single holder would lock the file.
                let (dist_c, dist_s) = db.parts_distributed();
                let (common, secret) = db.thresholds();
                let tight = common.map_or(false, |c| dist_c == u32::from(c))
                    || secret.map_or(false, |s| dist_s == u32::from(s));
                if tight {
                    console.print_color(ColorCode::Error);
                    console.print(msg(MsgId::InitSave5));
                    console.print_color(ColorCode::Output);
                    console.print(msg(MsgId::InitSave6));
                }
                console.print_color(ColorCode::Input);
                console.prompt_set(&db.prompt());
                Ok(())
            }
            Err(e) => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::ErrorScolon));
                console.print_color(ColorCode::Output);
                match e {
                    Error::InsufficientShares { .. } => {
                        console.print(msg(MsgId::ErrorFewDisParts))
                    }
                    ref other => console.print(&format!("{}\n", other)),
                }
                console.print_color(ColorCode::Input);
                Err(e)
            }
        }
    }

    fn holder_admin_db(
        &mut self,
        console: &mut dyn Console,
    ) -> Result<&mut Database> {
        match self.db {
            Some(ref mut db) => {
                if db.status() == Level::Init || db.status() == Level::Secret {
                    Ok(db)
                } else {
                    Err(Self::complain_not_secret(console))
                }
            }
            None => Err(Self::complain_no_db(console)),
        }
    }

    /// `new holder NICK`: asks for the password twice before the holder
    /// is created.
    pub fn new_holder(&mut self, console: &mut dyn Console, nickname: &str) -> Result<()> {
        {
            let db = self.holder_admin_db(console)?;
            if nickname.trim().is_empty() {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::InvNickname));
                console.print_color(ColorCode::Input);
                return Err(Error::InvalidArg("empty nickname".into()));
            }
            if db.find_holder(nickname).is_some() {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::ErrorScolon));
                console.print_color(ColorCode::Output);
                console.print(msg(MsgId::NewHolderErrAlready));
                console.print_color(ColorCode::Input);
                return Err(Error::InvalidArg("nickname already used".into()));
            }
        }

        console.print(msg(MsgId::NewHolderGivePwd));
        let mut password = console.read_line(true);
        console.print(msg(MsgId::NewHolderConfirmPwd));
        let mut confirm = console.read_line(true);
        let matches = password == confirm;
        wipe_string(&mut confirm);
        if !matches {
            wipe_string(&mut password);
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::ErrPwdConfirm));
            console.print_color(ColorCode::Input);
            return Err(Error::InvalidArg("password confirmation mismatch".into()));
        }

        let db = self.db.as_mut().unwrap();
        let id = db.new_holder(nickname)?;
        let outcome = db.set_holder_password(nickname, &password);
        wipe_string(&mut password);
        outcome?;
        console.print(&fill(
            msg(MsgId::NewHolderOk),
            &[&id.to_string(), nickname],
        ));
        console.prompt_set(&db.prompt());
        Ok(())
    }

    /// `delete holder NICK`
    pub fn delete_holder(&mut self, console: &mut dyn Console, nickname: &str) -> Result<()> {
        let db = self.holder_admin_db(console)?;
        if db.find_holder(nickname).is_none() {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::InvNickname));
            console.print_color(ColorCode::Input);
            return Err(Error::TryNotFound);
        }
        match db.delete_holder(nickname) {
            Ok(()) => {
                console.print(msg(MsgId::DelHoldOk));
                console.prompt_set(&db.prompt());
                Ok(())
            }
            Err(e @ Error::InsufficientShares { .. }) => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::DelHold1));
                console.print_color(ColorCode::Output);
                console.print(msg(MsgId::DelHold2));
                console.print_color(ColorCode::Input);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// `edit holder NICK password`
    pub fn edit_holder_password(
        &mut self,
        console: &mut dyn Console,
        nickname: &str,
    ) -> Result<()> {
        {
            let db = self.holder_admin_db(console)?;
            if db.find_holder(nickname).is_none() {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::InvNickname));
                console.print_color(ColorCode::Input);
                return Err(Error::TryNotFound);
            }
        }
        console.print(msg(MsgId::NewHolderGivePwd));
        let mut password = console.read_line(true);
        console.print(msg(MsgId::NewHolderConfirmPwd));
        let mut confirm = console.read_line(true);
        let matches = password == confirm;
        wipe_string(&mut confirm);
        if !matches {
            wipe_string(&mut password);
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::ErrPwdConfirm));
            console.print_color(ColorCode::Input);
            return Err(Error::InvalidArg("password confirmation mismatch".into()));
        }
        let db = self.db.as_mut().unwrap();
        let outcome = db.set_holder_password(nickname, &password);
        wipe_string(&mut password);
        outcome?;
        console.prompt_set(&db.prompt());
        Ok(())
    }

    /// `edit holder NICK common parts N`
    pub fn edit_holder_common_parts(
        &mut self,
        console: &mut dyn Console,
        nickname: &str,
        n: u16,
    ) -> Result<()> {
        let db = self.holder_admin_db(console)?;
        if db.find_holder(nickname).is_none() {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::InvNickname));
            console.print_color(ColorCode::Input);
            return Err(Error::TryNotFound);
        }
        match db.set_holder_nb_common(nickname, n) {
            Ok(()) => {
                console.prompt_set(&db.prompt());
                Ok(())
            }
            Err(e) => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::Fail));
                console.print_color(ColorCode::Input);
                Err(e)
            }
        }
    }

    /// `edit holder NICK secret parts N`
    pub fn edit_holder_secret_parts(
        &mut self,
        console: &mut dyn Console,
        nickname: &str,
        n: u16,
    ) -> Result<()> {
        let db = self.holder_admin_db(console)?;
        if db.find_holder(nickname).is_none() {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::InvNickname));
            console.print_color(ColorCode::Input);
            return Err(Error::TryNotFound);
        }
        match db.set_holder_nb_secret(nickname, n) {
            Ok(()) => {
                console.prompt_set(&db.prompt());
                Ok(())
            }
            Err(e) => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::Fail));
                console.print_color(ColorCode::Input);
                Err(e)
            }
        }
    }

    /// `edit holder NICK email E`
    pub fn edit_holder_email(
        &mut self,
        console: &mut dyn Console,
        nickname: &str,
        email: &str,
    ) -> Result<()> {
        let db = self.holder_admin_db(console)?;
        if db.find_holder(nickname).is_none() {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::InvNickname));
            console.print_color(ColorCode::Input);
            return Err(Error::TryNotFound);
        }
        if !email.is_empty() && !email.contains('@') {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::InvEmail));
            console.print_color(ColorCode::Input);
            return Err(Error::InvalidArg("invalid e-mail".into()));
        }
        db.set_holder_email(nickname, email)?;
        console.prompt_set(&db.prompt());
        Ok(())
    }

    /// `pwd`
    pub fn pwd(&mut self, console: &mut dyn Console) -> Result<()> {
        let db = match self.db {
            Some(ref mut db) => db,
            None => return Err(Self::complain_no_db(console)),
        };
        let path = db.pwd()?;
        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::Cwd));
        console.print_color(ColorCode::Value);
        console.print(&format!("{}\n", path));
        console.print_color(ColorCode::Input);
        Ok(())
    }

    /// `cd ID`
    pub fn cd(&mut self, console: &mut dyn Console, id: u32) -> Result<()> {
        let db = match self.db {
            Some(ref mut db) => db,
            None => return Err(Self::complain_no_db(console)),
        };
        match db.cd(id) {
            Ok(()) => {
                console.print(&fill(msg(MsgId::Chdir), &[&id.to_string()]));
                console.prompt_set(&db.prompt());
                Ok(())
            }
            Err(e) => {
                let _ = Self::complain_invalid_id(console);
                Err(e)
            }
        }
    }

    /// `ls`
    pub fn ls(&mut self, console: &mut dyn Console) -> Result<()> {
        let db = match self.db {
            Some(ref mut db) => db,
            None => return Err(Self::complain_no_db(console)),
        };
        let path = db.pwd()?;
        let folder = db.current_folder()?;
        console.print_color(ColorCode::Output);
        console.print(&fill(msg(MsgId::Ls1), &[&folder.id.to_string(), &path]));
        console.print(msg(MsgId::Ls2));
        console.print_color(ColorCode::Value);
        for sub in &folder.sub_folders {
            console.print(&format!("\t[{}] {}\n", sub.id, sub.title));
        }
        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::Ls3));
        console.print_color(ColorCode::Value);
        for item in &folder.secrets {
            console.print(&format!("\t[{}] {}\n", item.id, item.title));
        }
        console.print_color(ColorCode::Input);
        Ok(())
    }

    /// `new folder`: the title is asked interactively.
    pub fn new_folder(&mut self, console: &mut dyn Console) -> Result<()> {
        if self.db.is_none() {
            return Err(Self::complain_no_db(console));
        }
        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::NewFold1));
        console.print_color(ColorCode::Value);
        let title = console.read_line(false);
        let db = self.db.as_mut().unwrap();
        let id = db.new_folder(&title)?;
        console.print_color(ColorCode::Output);
        console.print(&fill(msg(MsgId::NewFold2), &[&id.to_string()]));
        console.print_color(ColorCode::Input);
        console.prompt_set(&db.prompt());
        Ok(())
    }

    /// `new secret`: the title is asked interactively.
    pub fn new_secret(&mut self, console: &mut dyn Console) -> Result<()> {
        if self.db.is_none() {
            return Err(Self::complain_no_db(console));
        }
        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::NewSec1));
        console.print_color(ColorCode::Value);
        let title = console.read_line(false);
        let db = self.db.as_mut().unwrap();
        let id = db.new_secret(&title)?;
        console.print_color(ColorCode::Output);
        console.print(&fill(msg(MsgId::NewSec2), &[&id.to_string()]));
        console.print_color(ColorCode::Input);
        console.prompt_set(&db.prompt());
        Ok(())
    }

    /// `delete ID [force]`: an item asks for confirmation, a folder must
    /// be empty unless forced.
    pub fn delete_entry(&mut self, console: &mut dyn Console, id: u32, force: bool) -> Result<()> {
        if self.db.is_none() {
            return Err(Self::complain_no_db(console));
        }

        let item_title = {
            let db = self.db.as_mut().unwrap();
            db.current_folder()?
                .secret_by_id(id)
                .map(|item| item.title.clone())
        };

        if let Some(title) = item_title {
            if !force {
                console.print_color(ColorCode::Output);
                console.print(&fill(msg(MsgId::DeleteId), &[&title]));
                console.print_color(ColorCode::Value);
                let answer = console.read_line(false);
                if answer != "o" && answer != "y" {
                    console.print(msg(MsgId::DeleteId4));
                    console.print_color(ColorCode::Input);
                    return Err(Error::InvalidArg("deletion cancelled".into()));
                }
            }
            let db = self.db.as_mut().unwrap();
            db.delete_secret(id)?;
            console.prompt_set(&db.prompt());
            return Ok(());
        }

        let db = self.db.as_mut().unwrap();
        let is_folder = db.current_folder()?.sub_folder_by_id(id).is_some();
        if !is_folder {
            return Err(Self::complain_invalid_id(console));
        }
        match db.delete_folder(id, force) {
            Ok(()) => {
                console.prompt_set(&db.prompt());
                Ok(())
            }
            Err(e) => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::DeleteId2));
                console.print_color(ColorCode::Output);
                console.print(msg(MsgId::DeleteId3));
                console.print_color(ColorCode::Input);
                Err(e)
            }
        }
    }

    /// `edit secret ID update field F`: shows the current value, then
    /// reads the new one.
    pub fn update_field(
        &mut self,
        console: &mut dyn Console,
        id: u32,
        field_name: &str,
    ) -> Result<()> {
        if self.db.is_none() {
            return Err(Self::complain_no_db(console));
        }
        if field_name.is_empty() {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::EdSec2));
            console.print_color(ColorCode::Input);
            return Err(Error::InvalidArg("empty field name".into()));
        }

        let current = {
            let db = self.db.as_mut().unwrap();
            if db.current_folder()?.secret_by_id(id).is_none() {
                return Err(Self::complain_invalid_id(console));
            }
            let exists = db
                .current_folder()?
                .secret_by_id(id)
                .map_or(false, |item| item.field_exists(field_name));
            if exists {
                Some(db.field_value(id, field_name)?)
            } else {
                None
            }
        };
        match current {
            Some(FieldValue::Plain(ref value)) => {
                console.print_color(ColorCode::Input);
                console.print(&fill(msg(MsgId::EdSec3), &[field_name]));
                console.print_color(ColorCode::Value);
                console.print(&format!("{}\n", value));
            }
            Some(FieldValue::Empty) => {
                console.print_color(ColorCode::Input);
                console.print(&fill(msg(MsgId::EdSec3), &[field_name]));
                console.print_color(ColorCode::Value);
                console.print(msg(MsgId::Empty));
            }
            Some(FieldValue::Locked) => {
                console.print_color(ColorCode::Input);
                console.print(&fill(msg(MsgId::EdSec3), &[field_name]));
                console.print_color(ColorCode::SecretValue);
                console.print(msg(MsgId::ShSec3));
            }
            None => {
                console.print_color(ColorCode::Input);
                console.print(msg(MsgId::EdSec4));
            }
        }

        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::EdSec5));
        console.print_color(ColorCode::Value);
        let mut value = console.read_line(false);
        let db = self.db.as_mut().unwrap();
        let outcome = db.update_field(id, field_name, &value);
        wipe_string(&mut value);
        match outcome {
            Ok(()) => {
                console.prompt_set(&db.prompt());
                console.print_color(ColorCode::Input);
                Ok(())
            }
            Err(e) => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::ErrorScolon));
                console.print_color(ColorCode::Output);
                console.print(msg(MsgId::ShSec3));
                console.print_color(ColorCode::Input);
                Err(e)
            }
        }
    }

    /// `edit secret ID delete field F`
    pub fn delete_field(
        &mut self,
        console: &mut dyn Console,
        id: u32,
        field_name: &str,
    ) -> Result<()> {
        let db = match self.db {
            Some(ref mut db) => db,
            None => return Err(Self::complain_no_db(console)),
        };
        if db.current_folder()?.secret_by_id(id).is_none() {
            return Err(Self::complain_invalid_id(console));
        }
        match db.delete_field(id, field_name) {
            Ok(()) => {
                console.prompt_set(&db.prompt());
                Ok(())
            }
            Err(e) => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::SecDelField));
                console.print_color(ColorCode::Input);
                Err(e)
            }
        }
    }

    /// `edit secret ID title`
    pub fn edit_secret_title(&mut self, console: &mut dyn Console, id: u32) -> Result<()> {
        if self.db.is_none() {
            return Err(Self::complain_no_db(console));
        }
        let current = {
            let db = self.db.as_mut().unwrap();
            match db.current_folder()?.secret_by_id(id) {
                Some(item) => item.title.clone(),
                None => return Err(Self::complain_invalid_id(console)),
            }
        };
        console.print_color(ColorCode::Output);
        console.print(&fill(msg(MsgId::EdSecTitle), &[&id.to_string()]));
        console.print_color(ColorCode::Value);
        console.print(&format!("{}\n", current));
        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::EdSecTitle2));
        console.print_color(ColorCode::Value);
        let title = console.read_line(false);
        let db = self.db.as_mut().unwrap();
        db.set_secret_title(id, &title)?;
        console.prompt_set(&db.prompt());
        console.print_color(ColorCode::Input);
        Ok(())
    }

    /// `edit secret ID generate field F [length N]`: only fills fields
    /// that already exist.
    pub fn generate_field(
        &mut self,
        console: &mut dyn Console,
        id: u32,
        field_name: &str,
        length: Option<usize>,
    ) -> Result<()> {
        let db = match self.db {
            Some(ref mut db) => db,
            None => return Err(Self::complain_no_db(console)),
        };
        if db.status() != Level::Secret {
            return Err(Self::complain_not_secret(console));
        }
        if db.current_folder()?.secret_by_id(id).is_none() {
            return Err(Self::complain_invalid_id(console));
        }
        let exists = db
            .current_folder()?
            .secret_by_id(id)
            .map_or(false, |item| item.field_exists(field_name));
        if !exists {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::InvalidField));
            console.print_color(ColorCode::Input);
            return Err(Error::InvalidArg(format!("no field '{}'", field_name)));
        }
        db.generate_field(id, field_name, length.unwrap_or(DEFAULT_GENERATED_LENGTH))?;
        console.prompt_set(&db.prompt());
        Ok(())
    }

    /// `edit secret ID secret F`
    pub fn field_secret(
        &mut self,
        console: &mut dyn Console,
        id: u32,
        field_name: &str,
    ) -> Result<()> {
        let db = match self.db {
            Some(ref mut db) => db,
            None => return Err(Self::complain_no_db(console)),
        };
        if db.status() != Level::Secret {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::ErrorScolon));
            console.print_color(ColorCode::Output);
            console.print(msg(MsgId::ShSec3));
            console.print_color(ColorCode::Input);
            return Err(Error::WrongLevel);
        }
        if db.current_folder()?.secret_by_id(id).is_none() {
            return Err(Self::complain_invalid_id(console));
        }
        let exists = db
            .current_folder()?
            .secret_by_id(id)
            .map_or(false, |item| item.field_exists(field_name));
        if !exists {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::InvalidField));
            console.print_color(ColorCode::Input);
            return Err(Error::InvalidArg(format!("no field '{}'", field_name)));
        }
        db.set_field_secret(id, field_name)?;
        console.prompt_set(&db.prompt());
        Ok(())
    }

    /// `edit secret ID common F`
    pub fn field_common(
        &mut self,
        console: &mut dyn Console,
        id: u32,
        field_name: &str,
    ) -> Result<()> {
        let db = match self.db {
            Some(ref mut db) => db,
            None => return Err(Self::complain_no_db(console)),
        };
        if db.status() != Level::Secret {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::ErrorScolon));
            console.print_color(ColorCode::Output);
            console.print(msg(MsgId::ShSec3));
            console.print_color(ColorCode::Input);
            return Err(Error::WrongLevel);
        }
        if db.current_folder()?.secret_by_id(id).is_none() {
            return Err(Self::complain_invalid_id(console));
        }
        db.set_field_common(id, field_name)?;
        console.prompt_set(&db.prompt());
        Ok(())
    }

    /// `show holders`
    pub fn show_holders(&mut self, console: &mut dyn Console) -> Result<()> {
        let db = match self.db {
            Some(ref mut db) => db,
            None => return Err(Self::complain_no_db(console)),
        };

        let mut any_open = false;
        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::ShowHold1));
        console.print_color(ColorCode::Value);
        for holder in db.holders() {
            if holder.chunk_status != ChunkStatus::Closed {
                any_open = true;
                console.print(&format!(
                    "\t{} {}/{} {}\n",
                    holder.nickname,
                    holder.nb_common(),
                    holder.nb_secret(),
                    holder.email.as_ref().map_or("", String::as_str),
                ));
            }
        }
        if !any_open {
            console.print(msg(MsgId::ShowHold2));
        }

        if db.status() < Level::Common {
            console.print_color(ColorCode::Output);
            console.print(msg(MsgId::ShowHold3));
        } else {
            console.print_color(ColorCode::Output);
            console.print(msg(MsgId::ShowHold4));
            console.print_color(ColorCode::Value);
            for holder in db.holders() {
                if holder.chunk_status == ChunkStatus::Closed {
                    console.print(&format!("\t{}\n", holder.nickname));
                }
            }
            console.print_color(ColorCode::Output);
            console.print(msg(MsgId::ShowHold5));
            console.print_color(ColorCode::Value);
            console.print(&format!("{}\n", db.nb_holders()));
        }
        console.print_color(ColorCode::Input);
        Ok(())
    }

    /// `show secret ID`: secret-tier fields below the secret level show
    /// the locked marker, never the ciphertext.
    pub fn show_secret(&mut self, console: &mut dyn Console, id: u32) -> Result<()> {
        if self.db.is_none() {
            return Err(Self::complain_no_db(console));
        }
        let (title, fields) = {
            let db = self.db.as_mut().unwrap();
            match db.current_folder()?.secret_by_id(id) {
                Some(item) => {
                    let names: Vec<(String, bool)> = item
                        .fields
                        .iter()
                        .map(|f| (f.field_name.clone(), f.secret))
                        .collect();
                    (item.title.clone(), names)
                }
                None => return Err(Self::complain_invalid_id(console)),
            }
        };

        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::ShSec1));
        console.print_color(ColorCode::Value);
        console.print(&id.to_string());
        console.print_color(ColorCode::Output);
        console.print("] : ");
        console.print_color(ColorCode::Value);
        console.print(&format!("{}\n", title));
        console.print_color(ColorCode::Output);
        console.print(msg(MsgId::ShSec2));

        for (name, is_secret) in fields {
            console.print_color(ColorCode::Output);
            console.print("\t[");
            console.print_color(ColorCode::Value);
            console.print(&name);
            console.print_color(ColorCode::Output);
            console.print("] : ");
            let value = {
                let db = self.db.as_mut().unwrap();
                db.field_value(id, &name)?
            };
            match value {
                FieldValue::Empty => {
                    console.print_color(ColorCode::Value);
                    console.print(msg(MsgId::Empty));
                }
                FieldValue::Locked => {
                    console.print_color(ColorCode::SecretValue);
                    console.print(msg(MsgId::ShSec3));
                }
                FieldValue::Plain(ref value) => {
                    console.print_color(if is_secret {
                        ColorCode::SecretValue
                    } else {
                        ColorCode::Value
                    });
                    console.print(&format!("{}\n", value));
                }
            }
        }
        console.print_color(ColorCode::Input);
        Ok(())
    }

    /// `check`: a status explanation and the part accounting.
    pub fn check(&mut self, console: &mut dyn Console) -> Result<()> {
        let db = match self.db {
            Some(ref mut db) => db,
            None => {
                console.print_color(ColorCode::Error);
                console.print(msg(MsgId::Check1));
                console.print_color(ColorCode::Output);
                console.print(msg(MsgId::Check2));
                console.print_color(ColorCode::Input);
                return Err(Error::NoDatabase);
            }
        };

        console.print_color(ColorCode::Output);
        console.print(msg(match db.status() {
            Level::Init => MsgId::Check3,
            Level::None => MsgId::Check4,
            Level::First => MsgId::Check5,
            Level::Common => MsgId::Check6,
            Level::Secret => MsgId::Check7,
        }));

        let (avail_c, avail_s) = db.parts_available();
        let (dist_c, dist_s) = db.parts_distributed();
        let (need_c, need_s) = db.thresholds();
        let need_c_text = need_c.map_or("?".to_string(), |c| c.to_string());
        let need_s_text = need_s.map_or("?".to_string(), |s| s.to_string());

        console.print(msg(MsgId::CheckNbp));
        console.print(msg(MsgId::CheckNb1));
        console.print_color(ColorCode::Value);
        console.print(&format!(
            "\tcommon {:>7} {:>8} {:>9}\n",
            avail_c, need_c_text, dist_c
        ));
        console.print(&format!(
            "\tsecret {:>7} {:>8} {:>9}\n",
            avail_s, need_s_text, dist_s
        ));

        if db.status() == Level::First {
            console.print_color(ColorCode::Output);
            console.print(msg(MsgId::CheckWarnFirst));
        }
        let tight = need_c.map_or(false, |c| dist_c <= u32::from(c))
            || need_s.map_or(false, |s| dist_s <= u32::from(s));
        if tight {
            console.print_color(ColorCode::Error);
            console.print(msg(MsgId::CheckWarn));
            console.print_color(ColorCode::Output);
            console.print(msg(MsgId::CheckJustEnough));
        }
        if db.is_changed() {
            console.print_color(ColorCode::Output);
            console.print(msg(MsgId::CheckChanged1));
            console.print("\n");
        }
        console.print_color(ColorCode::Input);
        Ok(())
    }

    /// `quit`: drops the database; tells the caller whether unsaved
    /// changes were thrown away so the UI can have warned first.
    pub fn quit(&mut self) -> bool {
        let dirty = self.db.as_ref().map_or(false, Database::is_changed);
        self.db = None;
        dirty
    }
}

impl Default for Session {
    fn default() -> Session {
        Session::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use std::path::PathBuf;
    use std::process;
    use ui::ScriptedConsole;

    fn scratch_file(tag: &str) -> PathBuf {
        let path = env::temp_dir().join(format!("mpm-cmd-{}-{}.mpm", tag, process::id()));
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn test_init_save_and_reopen_dialogue() {
        let path = scratch_file("dialogue");
        let mut session = Session::new();
        let mut console = ScriptedConsole::new(&["pa", "pa", "pb", "pb"]);

        session
            .init(&mut console, Some(&path), Some(1), Some(2))
            .expect("init");
        assert!(console.output.contains("1\n"));
        assert!(console.prompt.ends_with("(init) "));

        session.new_holder(&mut console, "A").expect("holder A");
        session.new_holder(&mut console, "B").expect("holder B");
        assert_eq!(console.remaining_inputs(), 0);
        session.save(&mut console, None).expect("save");
        // A save clears the dirty state, so quitting throws nothing away.
        assert!(!session.quit());
        assert!(!session.quit());

        // Reopen and walk the level ladder through the dialogue.
        let mut console = ScriptedConsole::new(&["pa", "pb"]);
        session.load(&mut console, &path).expect("load");
        assert!(console.prompt.ends_with("? "));
        session.try_holder(&mut console, "A").expect("try A");
        assert!(console.prompt.ends_with("> "));
        session.try_holder(&mut console, "B").expect("try B");
        assert!(console.prompt.ends_with("# "));
        assert!(console.output.contains("Ok. A brought 1/1 parts"));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_password_confirmation_gate() {
        let path = scratch_file("confirm");
        let mut session = Session::new();
        let mut console = ScriptedConsole::new(&["one", "two"]);
        session
            .init(&mut console, Some(&path), Some(1), Some(1))
            .expect("init");
        match session.new_holder(&mut console, "A") {
            Err(Error::InvalidArg(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        // The mismatch left no half-created holder behind.
        assert!(session.database().unwrap().holders().is_empty());
        // The never-saved database still counts as unsaved work.
        assert!(session.quit());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_secret_show_with_locked_marker() {
        let path = scratch_file("show");
        let mut session = Session::new();
        let mut console =
            ScriptedConsole::new(&["pa", "pa", "pb", "pb", "login", "alice", "hunter2"]);
        session
            .init(&mut console, Some(&path), Some(1), Some(2))
            .expect("init");
        session.new_holder(&mut console, "A").expect("holder A");
        session.new_holder(&mut console, "B").expect("holder B");
        session.save(&mut console, None).expect("save");

        session.new_secret(&mut console).expect("new secret");
        assert!(console.output.contains("New secret id: 2\n"));
        session.update_field(&mut console, 2, "user").expect("user");
        session.update_field(&mut console, 2, "pwd").expect("pwd");
        session.field_secret(&mut console, 2, "pwd").expect("tier");
        session.save(&mut console, None).expect("save again");
        session.quit();

        // At the common level the secret field shows the locked marker.
        let mut console = ScriptedConsole::new(&["pa"]);
        session.load(&mut console, &path).expect("load");
        session.try_holder(&mut console, "A").expect("try A");
        session.show_secret(&mut console, 2).expect("show");
        assert!(console.output.contains("alice"));
        assert!(!console.output.contains("hunter2"));
        assert!(console
            .output
            .contains("*database not open at the 'secret' level*"));

        // The second holder reveals it.
        let mut console = ScriptedConsole::new(&["pb"]);
        session.try_holder(&mut console, "B").expect("try B");
        session.show_secret(&mut console, 2).expect("show");
        assert!(console.output.contains("hunter2"));

        session.quit();
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_check_and_show_holders_output() {
        let path = scratch_file("check");
        let mut session = Session::new();
        let mut console = ScriptedConsole::new(&["pa", "pa"]);
        session
            .init(&mut console, Some(&path), Some(1), Some(1))
            .expect("init");
        session.new_holder(&mut console, "A").expect("holder A");

        let mut console = ScriptedConsole::new(&[]);
        session.check(&mut console).expect("check");
        assert!(console.output.contains("Blank database"));
        assert!(console.output.contains("common"));
        assert!(console.output.contains("modified"));

        let mut console = ScriptedConsole::new(&[]);
        session.show_holders(&mut console).expect("show holders");
        assert!(console.output.contains("\tA 1/1 \n"));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_folder_dialogue_and_delete_confirmation() {
        let path = scratch_file("folders");
        let mut session = Session::new();
        let mut console = ScriptedConsole::new(&[
            "mail",    // new folder title
            "imap",    // new secret title
            "alice",   // field value
            "n",       // refuse the deletion
            "y",       // confirm it
        ]);
        session
            .init(&mut console, Some(&path), Some(1), Some(1))
            .expect("init");

        session.new_folder(&mut console).expect("new folder");
        assert!(console.output.contains("New folder id = 2\n"));
        session.cd(&mut console, 2).expect("cd");
        session.pwd(&mut console).expect("pwd");
        assert!(console.output.contains("root/mail\n"));

        session.new_secret(&mut console).expect("new secret");
        session.update_field(&mut console, 3, "user").expect("field");
        session.ls(&mut console).expect("ls");
        assert!(console.output.contains("\t[3] imap\n"));

        // First answer refuses, second confirms.
        match session.delete_entry(&mut console, 3, false) {
            Err(Error::InvalidArg(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        session.delete_entry(&mut console, 3, false).expect("delete");

        // Back at the root, the emptied folder goes without force.
        session.cd(&mut console, 1).expect("cd up");
        session.delete_entry(&mut console, 2, false).expect("delete folder");
        assert_eq!(console.remaining_inputs(), 0);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_commands_without_database() {
        let mut session = Session::new();
        let mut console = ScriptedConsole::new(&[]);
        match session.pwd(&mut console) {
            Err(Error::NoDatabase) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(console.output.contains("No secret database loaded"));
        match session.save(&mut console, None) {
            Err(Error::NoDatabase) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_generate_field_needs_secret_level_and_field() {
        let path = scratch_file("generate");
        let mut session = Session::new();
        let mut console = ScriptedConsole::new(&["pa", "pa", "login", "x"]);
        session
            .init(&mut console, Some(&path), Some(1), Some(1))
            .expect("init");
        session.new_holder(&mut console, "A").expect("holder A");

        // Still INIT: generation is a secret-level operation.
        match session.generate_field(&mut console, 2, "pwd", None) {
            Err(Error::WrongLevel) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        session.save(&mut console, None).expect("save");
        session.new_secret(&mut console).expect("new secret");
        session.update_field(&mut console, 2, "pwd").expect("field");
        match session.generate_field(&mut console, 2, "nope", None) {
            Err(Error::InvalidArg(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        session
            .generate_field(&mut console, 2, "pwd", Some(10))
            .expect("generate");
        let db = session.database_mut().unwrap();
        match db.field_value(2, "pwd").expect("value") {
            FieldValue::Plain(ref v) => {
                assert_eq!(v.len(), 10);
                assert!(v.chars().all(|c| c.is_ascii_alphanumeric()));
            }
            other => panic!("unexpected value: {:?}", other),
        }

        let _ = fs::remove_file(&path);
    }
}
