//! Row Materializer - engine rows to `Card`s, and list membership lookups
//!
//! All reads go through the session's `SchemaTokens`. An unresolved token
//! reads as an absent field. Missing optional values fall back to defaults;
//! only a row whose identity cannot be read fails.

use crate::card::{Card, Value, parse_yarn_number};
use crate::engine::{Oid, RowId, RowStore};
use crate::schema::{Field, FieldKind, SchemaTokens};
use crate::{Error, Result};

/// Confirm the row exists and is readable
fn check_row(store: &dyn RowStore, oid: Oid) -> Result<()> {
    match store.has_row(oid) {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::RowNotFound(oid.id)),
        Err(e) => Err(Error::RowCorrupt {
            row_id: oid.id,
            reason: e.to_string(),
        }),
    }
}

/// Read one cell. Unresolved tokens and unreadable optional cells are absent.
fn read_yarn(store: &dyn RowStore, tokens: &SchemaTokens, oid: Oid, field: Field) -> Option<String> {
    let column = tokens.column(field)?;
    match store.cell(oid, column) {
        Ok(yarn) => yarn,
        Err(e) => {
            tracing::debug!("Treating unreadable {} on row {} as absent: {}", field, oid, e);
            None
        }
    }
}

/// Read a field and coerce it to the field's kind
fn read_value(store: &dyn RowStore, tokens: &SchemaTokens, oid: Oid, field: Field) -> Option<Value> {
    let yarn = read_yarn(store, tokens, oid, field)?;
    match field.kind() {
        FieldKind::Text => Some(Value::Text(yarn)),
        FieldKind::Number { default } => {
            Some(Value::Number(parse_yarn_number(&yarn).unwrap_or(default)))
        }
    }
}

/// Build a contact card from a card row
pub fn build_card(
    store: &dyn RowStore,
    tokens: &SchemaTokens,
    oid: Oid,
    owning_list: Option<RowId>,
) -> Result<Card> {
    check_row(store, oid)?;

    let mut card = Card::new();
    card.row_id = oid.id;
    card.list_row_id = owning_list;
    for field in Field::card_fields() {
        match read_value(store, tokens, oid, field) {
            Some(Value::Text(text)) => card.set_text(field, text),
            Some(Value::Number(n)) => card.set_number(field, n),
            None => {}
        }
    }
    Ok(card)
}

/// Build a mailing-list card from a list row
pub fn build_list_card(store: &dyn RowStore, tokens: &SchemaTokens, oid: Oid) -> Result<Card> {
    check_row(store, oid)?;

    let mut card = Card::new();
    card.row_id = oid.id;
    card.is_mail_list = true;

    let text = |field| read_yarn(store, tokens, oid, field).unwrap_or_default();
    let name = text(Field::ListName);
    card.set_text(Field::LowercaseListName, name.to_lowercase());
    card.set_text(Field::DisplayName, name.clone());
    card.set_text(Field::ListName, name);
    card.set_text(Field::NickName, text(Field::ListNickName));
    card.set_text(Field::Notes, text(Field::ListDescription));

    let total = list_total(store, tokens, oid)?;
    card.set_number(Field::ListTotalAddresses, total);
    card.list_total = Some(total);
    Ok(card)
}

/// Member count of a list: the stored total if usable, otherwise a recount
pub fn list_total(store: &dyn RowStore, tokens: &SchemaTokens, list: Oid) -> Result<u32> {
    let cached = read_yarn(store, tokens, list, Field::ListTotalAddresses)
        .and_then(|yarn| parse_yarn_number(&yarn));
    match cached {
        Some(total) => Ok(total),
        None => recount_list_total(store, list),
    }
}

/// Count the list's member row-set, ignoring any stored total
pub fn recount_list_total(store: &dyn RowStore, list: Oid) -> Result<u32> {
    let count = store.members_len(list)?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

/// Oid of the member at `position` (0-based, member row-set order)
pub fn address_at(store: &dyn RowStore, tokens: &SchemaTokens, list: Oid, position: u32) -> Result<Oid> {
    let total = list_total(store, tokens, list)?;
    if position >= total {
        return Err(Error::IndexOutOfRange {
            index: position,
            total,
        });
    }
    // A stale stored total can point past the last member slot.
    store
        .member_at(list, position as usize)?
        .ok_or(Error::MemberMissing {
            list_row_id: list.id,
            position,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryFactory, StoreFactory, Token};
    use std::path::Path;

    struct Fixture {
        factory: MemoryFactory,
        store: Box<dyn RowStore>,
        tokens: SchemaTokens,
        table: Token,
    }

    const PATH: &str = "/books/materialize.mab";

    fn fixture() -> Fixture {
        let factory = MemoryFactory::new();
        let mut store = factory.open(Path::new(PATH), true).unwrap();
        let tokens = SchemaTokens::initialize(store.as_mut()).unwrap();
        let table = tokens.address_table().unwrap();
        Fixture {
            factory,
            store,
            tokens,
            table,
        }
    }

    impl Fixture {
        fn card_oid(&self, id: RowId) -> Oid {
            Oid::new(self.tokens.card_scope().unwrap(), id)
        }

        fn list_oid(&self, id: RowId) -> Oid {
            Oid::new(self.tokens.list_scope().unwrap(), id)
        }

        fn set(&mut self, oid: Oid, field: Field, value: &str) {
            let column = self.tokens.column(field).unwrap();
            self.store.set_cell(oid, column, value).unwrap();
        }
    }

    #[test]
    fn test_build_card_reads_fields_and_defaults() {
        let mut fx = fixture();
        let oid = fx.card_oid(4);
        fx.store.new_row(fx.table, oid).unwrap();
        fx.set(oid, Field::FirstName, "Grace");
        fx.set(oid, Field::PopularityIndex, "a");
        fx.set(oid, Field::PreferMailFormat, "not-a-number");

        let card = build_card(fx.store.as_ref(), &fx.tokens, oid, Some(9)).unwrap();
        assert_eq!(card.row_id, 4);
        assert_eq!(card.list_row_id, Some(9));
        assert!(!card.is_mail_list);
        assert_eq!(card.text(Field::FirstName), "Grace");
        assert_eq!(card.text(Field::LastName), "");
        assert_eq!(card.popularity_index(), 10);
        assert_eq!(card.number(Field::PreferMailFormat), 0);
    }

    #[test]
    fn test_build_card_missing_and_unreadable_rows() {
        let mut fx = fixture();
        assert!(matches!(
            build_card(fx.store.as_ref(), &fx.tokens, fx.card_oid(1), None),
            Err(Error::RowNotFound(1))
        ));

        let oid = fx.card_oid(2);
        fx.store.new_row(fx.table, oid).unwrap();
        fx.factory.poison_row(Path::new(PATH), oid);
        assert!(matches!(
            build_card(fx.store.as_ref(), &fx.tokens, oid, None),
            Err(Error::RowCorrupt { row_id: 2, .. })
        ));
    }

    #[test]
    fn test_unresolved_tokens_read_as_absent() {
        let mut fx = fixture();
        let oid = fx.card_oid(3);
        fx.store.new_row(fx.table, oid).unwrap();
        fx.set(oid, Field::FirstName, "Grace");

        let unresolved = SchemaTokens::unresolved();
        let card = build_card(fx.store.as_ref(), &unresolved, oid, None).unwrap();
        assert_eq!(card.row_id, 3);
        assert_eq!(card.text(Field::FirstName), "");
    }

    #[test]
    fn test_list_total_prefers_stored_value_then_recounts() {
        let mut fx = fixture();
        let list = fx.list_oid(5);
        fx.store.new_row(fx.table, list).unwrap();
        for id in [1, 2] {
            fx.store.push_member(list, fx.card_oid(id)).unwrap();
        }

        assert_eq!(list_total(fx.store.as_ref(), &fx.tokens, list).unwrap(), 2);

        fx.set(list, Field::ListTotalAddresses, "3");
        assert_eq!(list_total(fx.store.as_ref(), &fx.tokens, list).unwrap(), 3);
        assert_eq!(recount_list_total(fx.store.as_ref(), list).unwrap(), 2);

        fx.set(list, Field::ListTotalAddresses, "garbage");
        assert_eq!(list_total(fx.store.as_ref(), &fx.tokens, list).unwrap(), 2);
    }

    #[test]
    fn test_address_at_bounds() {
        let mut fx = fixture();
        let list = fx.list_oid(5);
        fx.store.new_row(fx.table, list).unwrap();
        for id in [8, 6, 7] {
            fx.store.push_member(list, fx.card_oid(id)).unwrap();
        }

        let store = fx.store.as_ref();
        let found: Vec<RowId> = (0..)
            .map_while(|pos| address_at(store, &fx.tokens, list, pos).ok())
            .map(|oid| oid.id)
            .collect();
        assert_eq!(found, vec![8, 6, 7]);
        assert_eq!(found.len() as u32, recount_list_total(store, list).unwrap());

        assert!(matches!(
            address_at(store, &fx.tokens, list, 3),
            Err(Error::IndexOutOfRange { index: 3, total: 3 })
        ));
    }

    #[test]
    fn test_address_at_stale_total_names_the_slot() {
        let mut fx = fixture();
        let list = fx.list_oid(5);
        fx.store.new_row(fx.table, list).unwrap();
        fx.store.push_member(list, fx.card_oid(8)).unwrap();
        fx.set(list, Field::ListTotalAddresses, "3");

        let store = fx.store.as_ref();
        assert_eq!(address_at(store, &fx.tokens, list, 0).unwrap(), fx.card_oid(8));
        match address_at(store, &fx.tokens, list, 2) {
            Err(e @ Error::MemberMissing { list_row_id: 5, position: 2 }) => {
                assert!(e.is_row_level());
            }
            other => panic!("expected MemberMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_build_list_card() {
        let mut fx = fixture();
        let list = fx.list_oid(2);
        fx.store.new_row(fx.table, list).unwrap();
        fx.set(list, Field::ListName, "Engine Club");
        fx.set(list, Field::ListNickName, "engines");
        fx.set(list, Field::ListDescription, "Analytical folks");
        fx.store.push_member(list, fx.card_oid(1)).unwrap();

        let card = build_list_card(fx.store.as_ref(), &fx.tokens, list).unwrap();
        assert!(card.is_mail_list);
        assert_eq!(card.row_id, 2);
        assert_eq!(card.display_name(), "Engine Club");
        assert_eq!(card.text(Field::LowercaseListName), "engine club");
        assert_eq!(card.text(Field::NickName), "engines");
        assert_eq!(card.text(Field::Notes), "Analytical folks");
        assert_eq!(card.list_total, Some(1));
    }
}
