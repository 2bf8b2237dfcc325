//! Esquema Diesel (declarado a mano, reemplazable con `diesel
//! print-schema`).
//!
//! Los enums de estado se guardan como Int4 con los valores estables de
//! `idds-common::constants`; los objetos de larga vida van en columnas Jsonb
//! partidas en mitad estática (`*_metadata`) y dinámica (`running_metadata`).
//! Los períodos de poll se guardan como segundos enteros.

diesel::table! {
    requests (request_id) {
        request_id -> BigInt,
        scope -> Text,
        name -> Text,
        requester -> Nullable<Text>,
        request_type -> Integer,
        workload_id -> Nullable<BigInt>,
        priority -> Integer,
        status -> Integer,
        substatus -> Nullable<Integer>,
        oldstatus -> Nullable<Integer>,
        locking -> Integer,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        next_poll_at -> Timestamptz,
        expired_at -> Nullable<Timestamptz>,
        new_retries -> Integer,
        update_retries -> Integer,
        max_new_retries -> Integer,
        max_update_retries -> Integer,
        new_poll_period -> Integer,
        update_poll_period -> Integer,
        errors -> Nullable<Text>,
        request_metadata -> Nullable<Jsonb>,
        processing_metadata -> Nullable<Jsonb>,
    }
}

diesel::table! {
    transforms (transform_id) {
        transform_id -> BigInt,
        request_id -> BigInt,
        workload_id -> Nullable<BigInt>,
        transform_type -> Integer,
        transform_tag -> Text,
        priority -> Integer,
        name -> Text,
        status -> Integer,
        substatus -> Nullable<Integer>,
        oldstatus -> Nullable<Integer>,
        locking -> Integer,
        retries -> Integer,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        next_poll_at -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        finished_at -> Nullable<Timestamptz>,
        expired_at -> Nullable<Timestamptz>,
        new_retries -> Integer,
        update_retries -> Integer,
        max_new_retries -> Integer,
        max_update_retries -> Integer,
        new_poll_period -> Integer,
        update_poll_period -> Integer,
        errors -> Nullable<Text>,
        transform_metadata -> Nullable<Jsonb>,
        running_metadata -> Nullable<Jsonb>,
    }
}

diesel::table! {
    processings (processing_id) {
        processing_id -> BigInt,
        transform_id -> BigInt,
        request_id -> BigInt,
        workload_id -> Nullable<BigInt>,
        status -> Integer,
        substatus -> Nullable<Integer>,
        oldstatus -> Nullable<Integer>,
        locking -> Integer,
        submitter -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        next_poll_at -> Timestamptz,
        submitted_at -> Nullable<Timestamptz>,
        finished_at -> Nullable<Timestamptz>,
        expired_at -> Nullable<Timestamptz>,
        new_retries -> Integer,
        update_retries -> Integer,
        max_new_retries -> Integer,
        max_update_retries -> Integer,
        new_poll_period -> Integer,
        update_poll_period -> Integer,
        errors -> Nullable<Text>,
        processing_metadata -> Nullable<Jsonb>,
        running_metadata -> Nullable<Jsonb>,
        output_metadata -> Nullable<Jsonb>,
    }
}

diesel::table! {
    collections (coll_id) {
        coll_id -> BigInt,
        request_id -> BigInt,
        transform_id -> BigInt,
        workload_id -> Nullable<BigInt>,
        coll_type -> Integer,
        relation_type -> Integer,
        scope -> Text,
        name -> Text,
        bytes -> BigInt,
        status -> Integer,
        substatus -> Nullable<Integer>,
        locking -> Integer,
        total_files -> BigInt,
        new_files -> BigInt,
        processed_files -> BigInt,
        processing_files -> BigInt,
        failed_files -> BigInt,
        missing_files -> BigInt,
        ext_files -> BigInt,
        processed_ext_files -> BigInt,
        failed_ext_files -> BigInt,
        missing_ext_files -> BigInt,
        retries -> Integer,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        next_poll_at -> Timestamptz,
        expired_at -> Nullable<Timestamptz>,
        coll_metadata -> Nullable<Jsonb>,
    }
}

diesel::table! {
    contents (content_id) {
        content_id -> BigInt,
        transform_id -> BigInt,
        coll_id -> BigInt,
        request_id -> BigInt,
        workload_id -> Nullable<BigInt>,
        map_id -> BigInt,
        content_dep_id -> Nullable<BigInt>,
        scope -> Text,
        name -> Text,
        min_id -> Integer,
        max_id -> Integer,
        content_type -> Integer,
        content_relation_type -> Integer,
        status -> Integer,
        substatus -> Integer,
        locking -> Integer,
        bytes -> BigInt,
        md5 -> Nullable<Text>,
        adler32 -> Nullable<Text>,
        path -> Nullable<Text>,
        retries -> Integer,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        expired_at -> Nullable<Timestamptz>,
        content_metadata -> Nullable<Jsonb>,
    }
}

diesel::table! {
    contents_update (content_id) {
        content_id -> BigInt,
        substatus -> Integer,
        request_id -> BigInt,
        transform_id -> BigInt,
        workload_id -> Nullable<BigInt>,
        coll_id -> BigInt,
    }
}

diesel::table! {
    contents_ext (content_id) {
        content_id -> BigInt,
        transform_id -> BigInt,
        coll_id -> BigInt,
        request_id -> BigInt,
        workload_id -> Nullable<BigInt>,
        map_id -> BigInt,
        status -> Nullable<Integer>,
        panda_id -> Nullable<BigInt>,
        job_status -> Nullable<Text>,
        start_time -> Nullable<Timestamptz>,
        end_time -> Nullable<Timestamptz>,
        computing_site -> Nullable<Text>,
        attempt_nr -> Nullable<Integer>,
        core_count -> Nullable<Integer>,
        cpu_consumption_time -> Nullable<BigInt>,
        max_rss -> Nullable<BigInt>,
    }
}

diesel::table! {
    messages (msg_id) {
        msg_id -> BigInt,
        msg_type -> Integer,
        status -> Integer,
        locking -> Integer,
        source -> Integer,
        destination -> Integer,
        request_id -> Nullable<BigInt>,
        workload_id -> Nullable<BigInt>,
        transform_id -> Nullable<BigInt>,
        processing_id -> Nullable<BigInt>,
        num_contents -> Integer,
        retries -> Integer,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        msg_content -> Nullable<Jsonb>,
    }
}

diesel::table! {
    health (health_id) {
        health_id -> BigInt,
        agent -> Text,
        hostname -> Text,
        pid -> Integer,
        thread_id -> BigInt,
        thread_name -> Nullable<Text>,
        payload -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    commands (cmd_id) {
        cmd_id -> BigInt,
        request_id -> Nullable<BigInt>,
        workload_id -> Nullable<BigInt>,
        transform_id -> Nullable<BigInt>,
        processing_id -> Nullable<BigInt>,
        cmd_type -> Integer,
        status -> Integer,
        locking -> Integer,
        username -> Nullable<Text>,
        retries -> Integer,
        source -> Integer,
        destination -> Integer,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        cmd_content -> Nullable<Jsonb>,
        errors -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(requests, transforms, processings, collections, contents,
                                              contents_update, contents_ext, messages, health, commands,);
