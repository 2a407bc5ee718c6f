diesel::table! {
    cart_items (user_id, product_id) {
        user_id -> Varchar,
        product_id -> Varchar,
        quantity -> Int4,
        price -> Numeric,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Int8,
        event_type -> Varchar,
        payload -> Jsonb,
        partition_key -> Varchar,
        status -> Varchar,
        attempts -> Int4,
        error -> Nullable<Text>,
        created_at -> Timestamptz,
        sent_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(cart_items, outbox_events,);
