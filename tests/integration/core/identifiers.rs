//! Name, id and formula validation through the public API.

use proptest::prelude::*;

use endo_daemon::core::{Formula, FormulaId, PetName, SpecialName, is_valid_pet_name};

proptest! {
    #[test]
    fn lowercase_alnum_names_are_valid(name in "[a-z][a-z0-9]{0,30}") {
        prop_assert!(PetName::parse(&name).is_ok());
    }

    #[test]
    fn names_with_other_characters_are_rejected(
        head in "[a-z]{0,4}",
        bad in "[A-Z_. /-]",
        tail in "[a-z0-9]{0,4}",
    ) {
        let name = format!("{head}{bad}{tail}");
        prop_assert!(!is_valid_pet_name(&name));
        prop_assert_eq!(PetName::parse(&name).unwrap_err().code(), "invalid_name");
    }

    #[test]
    fn names_cannot_start_with_a_digit(name in "[0-9][a-z0-9]{0,8}") {
        prop_assert!(PetName::parse(&name).is_err());
    }
}

#[test]
fn special_names_are_not_pet_names() {
    for special in ["SELF", "MAIN", "NEW"] {
        assert!(SpecialName::parse(special).is_some());
        assert!(PetName::parse(special).is_err());
    }
    assert!(SpecialName::parse("self").is_none());
}

#[test]
fn unknown_formula_types_are_rejected() {
    let err = Formula::from_json_bytes(br#"{"type":"lookup","path":[]}"#).unwrap_err();
    assert!(err.to_string().contains("lookup"), "{err}");
    assert_eq!(
        Formula::from_json_bytes(br#"{"type":"worker"}"#).unwrap(),
        Formula::Worker
    );
}

#[test]
fn formula_ids_need_both_halves() {
    assert!(FormulaId::parse("abc").is_err());
    assert!(FormulaId::parse(&"a".repeat(128)).is_err());
    let id = format!("{}:{}", "a".repeat(128), "b".repeat(128));
    assert_eq!(FormulaId::parse(&id).unwrap().to_string(), id);
}
