// Diesel table definitions for the SQLite backend. Timestamps are stored as
// RFC 3339 text, matching the store conversion helpers in sqlite.rs.

diesel::table! {
    appointments (id) {
        id -> Integer,
        customer_id -> Nullable<Integer>,
        artist_id -> Integer,
        start_time -> Text,
        duration_minutes -> Integer,
        status -> Text,
        external_booking_id -> Nullable<Text>,
        notes -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    customers (id) {
        id -> Integer,
        name -> Text,
        email -> Text,
        phone -> Nullable<Text>,
        external_customer_id -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    payments (id) {
        id -> Integer,
        amount_cents -> BigInt,
        currency -> Text,
        status -> Text,
        method -> Text,
        external_payment_id -> Nullable<Text>,
        reference_id -> Nullable<Text>,
        raw_payload -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    sync_attempts (id) {
        id -> Integer,
        action -> Text,
        target_id -> Text,
        outcome -> Text,
        error_detail -> Nullable<Text>,
        payload -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(appointments, customers, payments, sync_attempts);
