//! Schema Token Table - logical field names resolved to engine tokens
//!
//! Every open session resolves its column, scope and table tokens exactly once.
//! Row access afterwards goes through the tokens only. Each entry is an
//! `Option<Token>`: an unresolved entry reads as "field absent" and never
//! reaches the engine.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::engine::{RowStore, Token};
use crate::{Error, Result};

pub const CARD_ROW_SCOPE: &str = "ns:addrbk:db:row:scope:card:all";
pub const LIST_ROW_SCOPE: &str = "ns:addrbk:db:row:scope:list:all";
pub const DATA_ROW_SCOPE: &str = "ns:addrbk:db:row:scope:data:all";
pub const ADDRESS_TABLE_KIND: &str = "ns:addrbk:db:table:kind:pab";
pub const DELETED_TABLE_KIND: &str = "ns:addrbk:db:table:kind:deleted";

/// How a field's cell is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Free text, empty when absent
    Text,
    /// Unsigned number stored as hex text, `default` when absent or ill-typed
    Number { default: u32 },
}

/// Which kind of row a field belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldGroup {
    Card,
    List,
    Data,
}

macro_rules! fields {
    ($($variant:ident => $name:literal, $kind:expr, $group:ident;)*) => {
        /// Logical columns of the address book
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Field {
            $($variant,)*
        }

        impl Field {
            pub const ALL: &'static [Field] = &[$(Field::$variant,)*];
            pub const COUNT: usize = Self::ALL.len();

            /// Column name in the store
            pub fn name(&self) -> &'static str {
                match self {
                    $(Field::$variant => $name,)*
                }
            }

            pub fn kind(&self) -> FieldKind {
                match self {
                    $(Field::$variant => $kind,)*
                }
            }

            pub fn group(&self) -> FieldGroup {
                match self {
                    $(Field::$variant => FieldGroup::$group,)*
                }
            }
        }
    };
}

const TEXT: FieldKind = FieldKind::Text;
const NUMBER: FieldKind = FieldKind::Number { default: 0 };

fields! {
    Uid => "UID", TEXT, Card;
    FirstName => "FirstName", TEXT, Card;
    LastName => "LastName", TEXT, Card;
    PhoneticFirstName => "PhoneticFirstName", TEXT, Card;
    PhoneticLastName => "PhoneticLastName", TEXT, Card;
    DisplayName => "DisplayName", TEXT, Card;
    NickName => "NickName", TEXT, Card;
    PrimaryEmail => "PrimaryEmail", TEXT, Card;
    LowercasePrimaryEmail => "LowercasePrimaryEmail", TEXT, Card;
    SecondEmail => "SecondEmail", TEXT, Card;
    LowercaseSecondEmail => "LowercaseSecondEmail", TEXT, Card;
    DefaultEmail => "DefaultEmail", TEXT, Card;
    CardType => "CardType", TEXT, Card;
    PreferMailFormat => "PreferMailFormat", NUMBER, Card;
    PopularityIndex => "PopularityIndex", NUMBER, Card;
    WorkPhone => "WorkPhone", TEXT, Card;
    HomePhone => "HomePhone", TEXT, Card;
    FaxNumber => "FaxNumber", TEXT, Card;
    PagerNumber => "PagerNumber", TEXT, Card;
    CellularNumber => "CellularNumber", TEXT, Card;
    WorkPhoneType => "WorkPhoneType", TEXT, Card;
    HomePhoneType => "HomePhoneType", TEXT, Card;
    FaxNumberType => "FaxNumberType", TEXT, Card;
    PagerNumberType => "PagerNumberType", TEXT, Card;
    CellularNumberType => "CellularNumberType", TEXT, Card;
    HomeAddress => "HomeAddress", TEXT, Card;
    HomeAddress2 => "HomeAddress2", TEXT, Card;
    HomeCity => "HomeCity", TEXT, Card;
    HomeState => "HomeState", TEXT, Card;
    HomeZipCode => "HomeZipCode", TEXT, Card;
    HomeCountry => "HomeCountry", TEXT, Card;
    WorkAddress => "WorkAddress", TEXT, Card;
    WorkAddress2 => "WorkAddress2", TEXT, Card;
    WorkCity => "WorkCity", TEXT, Card;
    WorkState => "WorkState", TEXT, Card;
    WorkZipCode => "WorkZipCode", TEXT, Card;
    WorkCountry => "WorkCountry", TEXT, Card;
    JobTitle => "JobTitle", TEXT, Card;
    Department => "Department", TEXT, Card;
    Company => "Company", TEXT, Card;
    AimScreenName => "_AimScreenName", TEXT, Card;
    AnniversaryYear => "AnniversaryYear", TEXT, Card;
    AnniversaryMonth => "AnniversaryMonth", TEXT, Card;
    AnniversaryDay => "AnniversaryDay", TEXT, Card;
    SpouseName => "SpouseName", TEXT, Card;
    FamilyName => "FamilyName", TEXT, Card;
    DefaultAddress => "DefaultAddress", TEXT, Card;
    Category => "Category", TEXT, Card;
    WebPage1 => "WebPage1", TEXT, Card;
    WebPage2 => "WebPage2", TEXT, Card;
    BirthYear => "BirthYear", TEXT, Card;
    BirthMonth => "BirthMonth", TEXT, Card;
    BirthDay => "BirthDay", TEXT, Card;
    Custom1 => "Custom1", TEXT, Card;
    Custom2 => "Custom2", TEXT, Card;
    Custom3 => "Custom3", TEXT, Card;
    Custom4 => "Custom4", TEXT, Card;
    Notes => "Notes", TEXT, Card;
    LastModifiedDate => "LastModifiedDate", NUMBER, Card;
    RecordKey => "RecordKey", NUMBER, Card;
    AddrCharSet => "AddrCharSet", TEXT, Data;
    LastRecordKey => "LastRecordKey", NUMBER, Data;
    ListName => "ListName", TEXT, List;
    ListNickName => "ListNickName", TEXT, List;
    ListDescription => "ListDescription", TEXT, List;
    ListTotalAddresses => "ListTotalAddresses", NUMBER, List;
    LowercaseListName => "LowercaseListName", TEXT, List;
}

impl Field {
    pub fn is_number(&self) -> bool {
        matches!(self.kind(), FieldKind::Number { .. })
    }

    /// Fields read when materializing a contact card
    pub fn card_fields() -> impl Iterator<Item = Field> {
        Self::ALL
            .iter()
            .copied()
            .filter(|f| f.group() == FieldGroup::Card)
    }
}

impl FromStr for Field {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Engine(format!("Unknown field: {}", s)))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Tokens resolved for one open session. Immutable once built.
#[derive(Debug, Clone)]
pub struct SchemaTokens {
    columns: [Option<Token>; Field::COUNT],
    card_scope: Option<Token>,
    list_scope: Option<Token>,
    data_scope: Option<Token>,
    address_table: Option<Token>,
    deleted_table: Option<Token>,
}

impl SchemaTokens {
    /// A table with nothing resolved. Every lookup against it fails closed.
    pub fn unresolved() -> Self {
        Self {
            columns: [None; Field::COUNT],
            card_scope: None,
            list_scope: None,
            data_scope: None,
            address_table: None,
            deleted_table: None,
        }
    }

    /// Resolve (or create) every token in `store`
    pub fn initialize(store: &mut dyn RowStore) -> Result<Self> {
        let mut resolve = |name: &str| -> Result<Token> {
            store
                .string_to_token(name)
                .map_err(|e| Error::SchemaInitFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
        };

        let mut tokens = Self::unresolved();
        tokens.card_scope = Some(resolve(CARD_ROW_SCOPE)?);
        tokens.list_scope = Some(resolve(LIST_ROW_SCOPE)?);
        tokens.data_scope = Some(resolve(DATA_ROW_SCOPE)?);
        tokens.address_table = Some(resolve(ADDRESS_TABLE_KIND)?);
        tokens.deleted_table = Some(resolve(DELETED_TABLE_KIND)?);
        for field in Field::ALL {
            tokens.columns[*field as usize] = Some(resolve(field.name())?);
        }

        tracing::debug!("Resolved {} column tokens", Field::COUNT);
        Ok(tokens)
    }

    pub fn column(&self, field: Field) -> Option<Token> {
        self.columns[field as usize]
    }

    pub fn card_scope(&self) -> Option<Token> {
        self.card_scope
    }

    pub fn list_scope(&self) -> Option<Token> {
        self.list_scope
    }

    pub fn data_scope(&self) -> Option<Token> {
        self.data_scope
    }

    pub fn address_table(&self) -> Option<Token> {
        self.address_table
    }

    /// Table kind of the deleted-cards table
    pub fn deleted_table(&self) -> Option<Token> {
        self.deleted_table
    }

    pub fn is_card_scope(&self, scope: Token) -> bool {
        self.card_scope == Some(scope)
    }

    pub fn is_list_scope(&self, scope: Token) -> bool {
        self.list_scope == Some(scope)
    }

    pub fn is_data_scope(&self, scope: Token) -> bool {
        self.data_scope == Some(scope)
    }
}
