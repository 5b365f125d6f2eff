//! The user-facing message catalogue. Messages are addressed by a fixed id,
//! exist in English and French, and the language is picked once per process
//! from the first two characters of `LANG`. `{}` placeholders are filled by
//! the command layer.

use std::env;

/// Number of message ids; both catalogues carry exactly this many entries.
pub const MSG_NB_ID: usize = 84;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Lang {
    En,
    Fr,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum MsgId {
    Chdir = 0,
    Check1,
    Check2,
    Check3,
    Check4,
    Check5,
    Check6,
    Check7,
    CheckChanged1,
    CheckJustEnough,
    CheckNb1,
    CheckNbp,
    CheckWarn,
    CheckWarnFirst,
    Cwd,
    DeleteId,
    DeleteId2,
    DeleteId3,
    DeleteId4,
    DelHold1,
    DelHold2,
    DelHoldOk,
    EdSec1,
    EdSec2,
    EdSec3,
    EdSec4,
    EdSec5,
    EdSecTitle,
    EdSecTitle2,
    Empty,
    ErrOpenFile,
    ErrorFewDisParts,
    ErrorNoDb,
    ErrorNoDb2,
    ErrorScolon,
    ErrDbAlready,
    ErrDbAlready2,
    ErrNoFilename,
    ErrPwdConfirm,
    Fail,
    FirstOk,
    GivePwd,
    InitFile1,
    InitFile2,
    InitFile3,
    InitFile4,
    InitFile5,
    InitFile6,
    InitFile7,
    InitSave1,
    InitSave2,
    InitSave3,
    InitSave4,
    InitSave5,
    InitSave6,
    InvalidField,
    InvalidId,
    InvEmail,
    InvNickname,
    Ls1,
    Ls2,
    Ls3,
    NewFold1,
    NewFold2,
    NewHolderConfirmPwd,
    NewHolderErrAlready,
    NewHolderGivePwd,
    NewHolderNotSecret,
    NewHolderOk,
    NewSec1,
    NewSec2,
    SecDelField,
    ShowHold1,
    ShowHold2,
    ShowHold3,
    ShowHold4,
    ShowHold5,
    ShSec1,
    ShSec2,
    ShSec3,
    TryNok1,
    TryNokAlready,
    TryNokInconsistent,
    TryOk,
}

static MSG_EN: [&str; MSG_NB_ID] = [
    "changing folder to '{}'\n",
    "No secret database loaded\n",
    "Load one with 'load' or create one with 'init'\n",
    "Blank database. Create holders before saving\n",
    "Closed database, no holder has opened their parts. The file cannot be told apart from random data\n",
    "At least one holder has opened their parts, not enough to reach the 'common' level\n",
    "The database is open at the 'common' level. Secrets stay hidden, and holders cannot be added.\n",
    "The database is open including the 'secret' level. Everything is editable and new holders can be added.\n",
    "The database has been modified. ",
    "The number of distributed parts barely reaches the number required (use 'show holders').\n",
    "              Avail.   Needed   Distrib.\n",
    "\nPart counts:\n",
    "\nWarning: ",
    "Warning: database open at the 'first' level, the distributed part count is not complete\n",
    "current path: ",
    "Deleting '{}': confirm (y/n) ",
    "Error: folder is not empty.",
    " Use 'force'\n",
    " - cancelled\n",
    "Cannot delete: ",
    "Distribute more parts first.\nUse 'check' and 'show holders' to see the distributed parts\n",
    "Holder deleted\n",
    "Error: the all-fields review dialogue is not implemented yet\n",
    "Bad field name\n",
    "Current value of field [{}]: ",
    "New field.\n",
    "Enter the new value of this field: ",
    "Current title [{}]: ",
    "Enter a new title: ",
    "(empty)\n",
    "Error opening the file\n",
    "Not enough parts are distributed for the requested thresholds\n",
    "No secret database loaded\n",
    "Load one with 'load' or create one with 'init'\n",
    "Error: ",
    "Error: a database is already open\n",
    "You must close it first\n",
    "Error: no file name given.",
    "Error: password confirmation does not match.\n",
    "Failed\n",
    "File attached. Now open parts with 'try'\n",
    "\tEnter the password of '{}': ",
    "Error: a database is already open\n",
    "It must be closed first...\n",
    "Initialising a new database\n",
    "- File name: ",
    "not set (will be asked at save time)\n",
    "- Threshold for the 'common' level: ",
    "- Threshold for the 'secret' level: ",
    "No secret database loaded\n",
    "Load one with 'load' or create one with 'init'\n",
    "No file name given.",
    " Pass one to the 'save' command\n",
    "Warning: ",
    "The number of distributed parts is exactly the number required (use 'check' and 'show holders').\n",
    "Bad field name\n",
    "Bad id\n",
    "Invalid e-mail address\n",
    "Invalid nickname\n",
    "Current folder: [{}] {}\n\n",
    "Sub-folders:\n",
    "Secret entries:\n",
    "Title of the new folder? ",
    "New folder id = {}\n",
    "\tConfirm the password: ",
    "This holder already exists, or the nickname is already used.\n",
    "\tGive this new holder a password: ",
    "The database must be open at the 'secret' level to manage holders.\n",
    "\tNew holder (id={} '{}') created. Their parts are available, and their count can be changed.\n",
    "Give this secret a title: ",
    "New secret id: {}\n",
    "No such field\n",
    "Holders whose parts are unlocked (nickname / common parts / secret parts / email):\n",
    "No holder is known in this database yet\n",
    "The number of holders is still unknown at this level\n",
    "Holders who have not unlocked their parts:\n",
    "Total number of holders detected: ",
    "Secret [",
    "Contents:\n",
    "*database not open at the 'secret' level*\n",
    " Unknown nickname or wrong password.\n",
    " {}'s parts were already open.\n",
    " the database is inconsistent.\n",
    "Ok. {} brought {}/{} parts\n",
];

static MSG_FR: [&str; MSG_NB_ID] = [
    "changement de répertoire vers '{}'\n",
    "Pas de base de secret chargée\n",
    "Vous devriez en charger une avec 'load' ou en créer une avec 'init'\n",
    "Base de données vierge. Vous devez créer des porteurs avant d'enregistrer\n",
    "Base de données fermée, aucun porteur n'a ouvert ses parts. Aucun moyen de distinguer la base de données aléatoires\n",
    "Un porteur au moins a ouvert ses parts, mais pas assez pour atteindre le niveau 'common'\n",
    "La base est ouverte au niveau 'common'. Les secrets restent cachés. Il n'est pas possible de rajouter des porteurs.\n",
    "La base est ouverte y compris au niveau 'secret'. Tout est éditable. Il est possible de rajouter de nouveaux porteurs.\n",
    "La base a été modifiée. ",
    "Le nombre de parts distribuées est juste égal ou inférieur au nombre de parts nécessaires (utilisez 'show holders').\n",
    "              Dispo.   Necess.  Distrib.\n",
    "\nNombre de parts :\n",
    "\nAttention : ",
    "Attention : base ouverte au niveau 'first', le décompte des parts distribuées n'est pas complet\n",
    "chemin actuel : ",
    "Suppression de '{}' : confirmez (o/n) ",
    "Erreur : dossier non vide.",
    " Utilisez 'force'\n",
    " - annulé\n",
    "Suppression impossible : ",
    "Vous devez distribuer plus de parts au préalable.\nUtilisez les commandes 'check' et 'show holders' pour voir les parts distribuées\n",
    "Suppression ok\n",
    "Erreur : dialogue de revue de tous les champs pas encore implémenté\n",
    "Nom de champ incorrect\n",
    "Valeur actuelle du champ [{}] : ",
    "Nouveau champ.\n",
    "Entrez la nouvelle valeur de ce champ : ",
    "Titre actuel [{}] : ",
    "Entrez un nouveau titre : ",
    "(vide)\n",
    "Erreur à l'ouverture du fichier\n",
    "Le nombre de parts distribuées est insuffisant pour les seuils demandés\n",
    "Pas de base de secret chargée\n",
    "Vous devriez en charger une avec 'load' ou en créer une avec 'init'\n",
    "Erreur : ",
    "Erreur : une base est déjà ouverte\n",
    "Vous devez la fermer d'abord\n",
    "Erreur : pas de nom de fichier fourni.",
    "Erreur : confirmation du mot de passe incorrecte.\n",
    "Echec\n",
    "Accès au fichier Ok. Vous devez maintenant ouvrir des parts avec 'try'\n",
    "\tEntrez le mot de passe de '{}' : ",
    "Erreur : une base est déjà ouverte\n",
    "Il faudrait la fermer d'abord...\n",
    "Initialisation d'une nouvelle base\n",
    "- Nom de fichier : ",
    "non fixé (sera demandé à la sauvegarde)\n",
    "- Seuil pour ouverture 'common' : ",
    "- Seuil pour ouverture 'secret' : ",
    "Pas de base de secret chargée\n",
    "Vous devriez en charger une avec 'load' ou en créer une avec 'init'\n",
    "Pas de nom de fichier fourni.",
    " Utilisez donc l'option à la commande 'save'\n",
    "Attention : ",
    "Le nombre de parts distribuées est juste égal au nombre de parts nécessaires (utilisez 'check' et 'show holders').\n",
    "Nom de champ incorrect\n",
    "ID incorrect\n",
    "Adresse e-mail invalide\n",
    "Nickname invalide\n",
    "Dossier courant : [{}] {}\n\n",
    "Sous-dossiers :\n",
    "Entrées de secrets :\n",
    "Titre du nouveau dossier ? ",
    "ID du nouveau dossier = {}\n",
    "\tConfirmez le mot de passe : ",
    "Ce holder existe déjà, ou ce nickname est déjà utilisé.\n",
    "\tDonnez un mot de passe pour ce nouveau porteur : ",
    "La base doit être ouverte au niveau 'secret' pour pouvoir gérer les porteurs.\n",
    "\tNouveau porteur (id={} '{}') créé. Ses parts sont disponibles, et vous pouvez en changer le nombre.\n",
    "Donnez un titre à ce secret : ",
    "id du nouveau secret : {}\n",
    "Champ inexistant\n",
    "Porteurs déclarés dont les parts sont débloquées (nickname / nb parts common / nb parts secret / email) :\n",
    "Aucun porteur n'est encore connu dans cette base\n",
    "Nombre de holders encore inconnu dans cet état\n",
    "Porteurs n'ayant pas débloqué leurs parts :\n",
    "Nombre total de holders détecté : ",
    "Secret [",
    "Contenu :\n",
    "*base pas ouverte au niveau 'secret'*\n",
    " Nickname inconnu ou mot de passe erroné.\n",
    " les parts de {} étaient déjà ouvertes.\n",
    " incohérence dans la base.\n",
    "Ok. {} a apporté des parts {}/{}\n",
];

lazy_static! {
    static ref CURRENT_LANG: Lang = lang_from_env();
}

fn lang_from_env() -> Lang {
    match env::var("LANG") {
        Ok(ref lang) if lang.starts_with("fr") => Lang::Fr,
        _ => Lang::En,
    }
}

/// The message for `id` in the process locale.
pub fn msg(id: MsgId) -> &'static str {
    msg_in(*CURRENT_LANG, id)
}

/// The message for `id` in an explicit language.
pub fn msg_in(lang: Lang, id: MsgId) -> &'static str {
    match lang {
        Lang::En => MSG_EN[id as usize],
        Lang::Fr => MSG_FR[id as usize],
    }
}

/// Fills the `{}` placeholders of a catalogue message, left to right.
pub fn fill(template: &str, args: &[&str]) -> String {
    let mut out = template.to_string();
    for arg in args {
        out = out.replacen("{}", arg, 1);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogues_are_complete() {
        for i in 0..MSG_NB_ID {
            assert!(!MSG_EN[i].is_empty(), "empty English message {}", i);
            assert!(!MSG_FR[i].is_empty(), "empty French message {}", i);
        }
    }

    #[test]
    fn test_ids_index_both_catalogues() {
        assert_eq!(msg_in(Lang::En, MsgId::Empty), "(empty)\n");
        assert_eq!(msg_in(Lang::Fr, MsgId::Empty), "(vide)\n");
        assert_eq!(msg_in(Lang::En, MsgId::TryOk), "Ok. {} brought {}/{} parts\n");
        assert_eq!(MsgId::TryOk as usize, MSG_NB_ID - 1);
    }

    #[test]
    fn test_fill_replaces_in_order() {
        assert_eq!(
            fill(msg_in(Lang::En, MsgId::TryOk), &["A", "1", "2"]),
            "Ok. A brought 1/2 parts\n"
        );
        assert_eq!(fill("no placeholders", &["x"]), "no placeholders");
    }
}
