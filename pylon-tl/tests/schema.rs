use pylon_tl::schema::{CombinatorDecl, FieldType, FunctionDecl, Scalar, Schema, SchemaError};

const SERVICE_SUBSET: &str = "
resPQ#05162463 nonce:int128 server_nonce:int128 pq:bytes server_public_key_fingerprints:Vector<long> = ResPQ;
message msg_id:long seqno:int bytes:int body:Object = Message;
msg_container#73f1f8dc messages:vector<%Message> = MessageContainer;
future_salt valid_since:int valid_until:int salt:long = FutureSalt;
future_salts req_msg_id:long now:int salts:vector<future_salt> = FutureSalts;
pong msg_id:long ping_id:long = Pong;

---functions---

ping ping_id:long = Pong;
invokeWithLayer#da9b0d0d {X:Type} layer:int query:!X = X;
";

#[test]
fn crc_numbering_matches_known_ids() {
    let schema = Schema::from_tl(SERVICE_SUBSET).unwrap();
    let id = |name: &str| schema.id_of(name).unwrap();
    assert_eq!(id("resPQ"), 0x05162463);
    assert_eq!(id("message"), 0x5bb8e511);
    assert_eq!(id("future_salt"), 0x0949d9dc);
    assert_eq!(id("future_salts"), 0xae500895);
    assert_eq!(id("pong"), 0x347773c5);
    assert_eq!(id("ping"), 0x7abe77ec);
    assert_eq!(id("invokeWithLayer"), 0xda9b0d0d);
}

#[test]
fn builder_and_text_agree() {
    let decl = CombinatorDecl::new("pong").field("msg_id", "long").field("ping_id", "long");
    assert_eq!(decl.number().unwrap(), 0x347773c5);
    // Stable across calls.
    assert_eq!(decl.number().unwrap(), decl.number().unwrap());
}

#[test]
fn changing_a_field_changes_the_id() {
    let a = CombinatorDecl::new("pong").field("msg_id", "long").field("ping_id", "long");
    let b = CombinatorDecl::new("pong").field("msg_id", "long").field("ping_id", "int");
    let c = a.clone().order(["ping_id", "msg_id"]);
    assert_ne!(a.number().unwrap(), b.number().unwrap());
    assert_ne!(a.number().unwrap(), c.number().unwrap());
}

#[test]
fn optional_fields_prepend_flags() {
    let schema = Schema::builder()
        .combinator(
            CombinatorDecl::new("user")
                .field("id", "long")
                .optional("username", 0, "string")
                .boxed("User"),
        )
        .combinator(
            CombinatorDecl::new("user2")
                .optional("self", 10, "true")
                .field("id", "long")
                .boxed("User"),
        )
        .build()
        .unwrap();

    let user = schema.combinator_by_name("user").unwrap();
    assert_eq!(user.numbering(), "user flags:# id:long username:flags.0?string = User");
    assert_eq!(user.id, 0x5c12f94f);
    assert_eq!(user.shape.flags.as_deref(), Some("flags"));
    assert_eq!(user.fields()[1].flag, Some(0));

    assert_eq!(schema.boxed_type("User").unwrap().variants.len(), 2);
}

#[test]
fn bare_vector_of_percent_type() {
    let schema = Schema::from_tl(SERVICE_SUBSET).unwrap();
    let container = schema.combinator(0x73f1f8dc).unwrap();
    assert_eq!(
        container.fields()[0].ty,
        FieldType::BareVector(Box::new(FieldType::Bare("message".into())))
    );
    assert_eq!(container.numbering(), "msg_container messages:vector message = MessageContainer");
}

#[test]
fn unknown_field_type_names_the_field() {
    let err = Schema::builder()
        .combinator(CombinatorDecl::new("a").field("x", "long").field("y", "Nowhere"))
        .build()
        .unwrap_err();
    match err {
        SchemaError::InvalidCombinator { name, field, .. } => {
            assert_eq!(name, "a");
            assert_eq!(field.as_deref(), Some("y"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn order_must_match_fields() {
    let missing = CombinatorDecl::new("a").field("x", "int").field("y", "int").order(["x"]);
    assert!(matches!(
        missing.number(),
        Err(SchemaError::InvalidCombinator { field: Some(f), .. }) if f == "y"
    ));

    let extra = CombinatorDecl::new("a").field("x", "int").order(["x", "z"]);
    assert!(matches!(
        extra.number(),
        Err(SchemaError::InvalidCombinator { field: Some(f), .. }) if f == "z"
    ));
}

#[test]
fn empty_name_is_rejected() {
    assert!(matches!(
        CombinatorDecl::new("").field("x", "int").number(),
        Err(SchemaError::InvalidCombinator { .. })
    ));
}

#[test]
fn function_validation() {
    let no_return = Schema::builder().function(FunctionDecl::new("f").param("a", "int")).build();
    assert!(matches!(no_return, Err(SchemaError::InvalidFunction { param: None, .. })));

    let bad_param = Schema::builder()
        .function(FunctionDecl::new("f").param("a", "Missing").returns("Bool"))
        .build();
    assert!(matches!(
        bad_param,
        Err(SchemaError::InvalidFunction { param: Some(p), .. }) if p == "a"
    ));

    let ok = Schema::builder()
        .function(FunctionDecl::new("f").param("a", "Vector<int>").returns("Vector<long>"))
        .build()
        .unwrap();
    let f = ok.function_by_name("f").unwrap();
    assert_eq!(f.returns, FieldType::Vector(Box::new(FieldType::Scalar(Scalar::Long))));
    assert_eq!(f.numbering(), "f a:Vector int = Vector long");
}

#[test]
fn true_requires_a_flag() {
    let err = Schema::from_tl("a x:true = A;").unwrap_err();
    assert!(matches!(err, SchemaError::InvalidCombinator { field: Some(f), .. } if f == "x"));
}

#[test]
fn duplicate_ids_fail_construction() {
    let err = Schema::from_tl("a#00000001 = A;\nb#00000001 = B;").unwrap_err();
    assert_eq!(
        err,
        SchemaError::DuplicateId { id: 1, first: "a".into(), second: "b".into() }
    );
}

#[test]
fn duplicate_names_fail_construction() {
    let err = Schema::from_tl("a x:int = A;\na y:int = A;").unwrap_err();
    assert_eq!(err, SchemaError::DuplicateName { name: "a".into() });
}

#[test]
fn builtins_in_text_are_skipped() {
    let schema = Schema::from_tl("boolFalse#bc799737 = Bool;\nboolTrue#997275b5 = Bool;\ntrue#3fedd339 = True;")
        .unwrap();
    assert!(schema.combinators().is_empty());
}

#[test]
fn depends_on_exposes_foreign_types() {
    let base = Schema::from_tl(SERVICE_SUBSET).unwrap();
    let user = Schema::builder()
        .depends_on(&base)
        .function(FunctionDecl::new("echoPong").param("p", "Pong").returns("Pong"))
        .build()
        .unwrap();
    assert!(user.function_by_name("echoPong").is_some());
}

#[test]
fn tl_export_round_trips() {
    let schema = Schema::from_tl(SERVICE_SUBSET).unwrap();
    let text = schema.to_tl();
    assert!(text.contains("pong#347773c5 msg_id:long ping_id:long = Pong;"));
    assert!(text.contains("msg_container#73f1f8dc messages:vector<message> = MessageContainer;"));

    let again = Schema::from_tl(&text).unwrap();
    assert_eq!(again.combinators(), schema.combinators());
    assert_eq!(again.functions(), schema.functions());
    assert_eq!(again.to_tl(), text);
    for c in again.combinators() {
        assert_eq!(pylon_tl_parser::crc32(c.numbering().as_bytes()), c.id, "{}", c.name);
    }
}

#[test]
fn json_export() {
    let schema = Schema::builder()
        .combinator(
            CombinatorDecl::new("user")
                .field("id", "long")
                .optional("username", 0, "string")
                .boxed("User"),
        )
        .function(FunctionDecl::new("ping").param("ping_id", "long").returns("Bool"))
        .build()
        .unwrap();

    let json: serde_json::Value = serde_json::from_str(&schema.to_json_string().unwrap()).unwrap();
    let ctor = &json["constructors"][0];
    assert_eq!(ctor["predicate"], "user");
    assert_eq!(ctor["id"], (0x5c12f94fu32 as i32).to_string());
    assert_eq!(ctor["type"], "User");
    assert_eq!(ctor["params"][0]["type"], "#");
    assert_eq!(ctor["params"][2]["type"], "flags.0?string");
    assert_eq!(json["methods"][0]["method"], "ping");
    assert_eq!(json["methods"][0]["type"], "Bool");
}
