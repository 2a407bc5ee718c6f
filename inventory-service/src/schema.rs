diesel::table! {
    inventory (product_id) {
        product_id -> Varchar,
        total_quantity -> Int4,
        reserved_quantity -> Int4,
        status -> Varchar,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    processed_events (idempotency_key) {
        idempotency_key -> Varchar,
        event_type -> Varchar,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    inventory,
    processed_events,
);
