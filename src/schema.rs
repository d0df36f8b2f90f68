// Migration bookkeeping tables for Diesel ORM

diesel::table! {
    schema_migrations (id) {
        id -> Integer,
        name -> Text,
        checksum -> Text,
        applied_at -> Text,
        rows_migrated -> BigInt,
        outcome -> Text,
    }
}
