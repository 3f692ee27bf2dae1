// Hand-maintained; must match the DDL in repository/context.rs.

diesel::table! {
    records (id) {
        id -> Integer,
        kind -> Text,
        external_key -> Text,
        natural_key -> Text,
        fields -> Text,
        first_seen_at -> Text,
        updated_at -> Text,
        update_count -> Integer,
    }
}

diesel::table! {
    work_items (id) {
        id -> Integer,
        job -> Text,
        external_key -> Text,
        target_url -> Text,
        label -> Nullable<Text>,
        status -> Text,
        attempts -> Integer,
        last_error -> Nullable<Text>,
        enqueued_at -> Text,
        finished_at -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(records, work_items);
