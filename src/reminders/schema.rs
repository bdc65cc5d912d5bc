diesel::table! {
    reminders (id) {
        id -> Integer,
        remote_id -> Nullable<BigInt>,
        chat_id -> Text,
        owner -> Text,
        title -> Text,
        description -> Nullable<Text>,
        scheduled_at -> Nullable<BigInt>,
        created_at -> BigInt,
        notified -> Bool,
        constant_notify -> Bool,
        notify_stopped -> Bool,
        repeat -> Bool,
        repeat_unit -> Nullable<Text>,
        repeat_count -> Nullable<Integer>,
        recurrence_created -> Bool,
        sync_status -> Text,
        last_updated -> BigInt,
    }
}

diesel::table! {
    pending_deletions (id) {
        id -> Integer,
        #[sql_name = "table"]
        table_name -> Text,
        local_id -> Integer,
        remote_id -> Nullable<BigInt>,
        deleted_at -> BigInt,
    }
}

diesel::table! {
    reminder_dirty_fields (reminder_id, field) {
        reminder_id -> Integer,
        field -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(reminders, pending_deletions, reminder_dirty_fields);
