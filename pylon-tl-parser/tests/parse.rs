use pylon_tl_parser::errors::ParseError;
use pylon_tl_parser::{parse_tl_file, tl::Category};

#[test]
fn parses_simple_type() {
    let src = "boolFalse#bc799737 = Bool;";
    let defs: Vec<_> = parse_tl_file(src).collect::<Result<_, _>>().unwrap();
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0].name, "boolFalse");
    assert_eq!(defs[0].id(), 0xbc799737);
    assert_eq!(defs[0].ty.name, "Bool");
}

#[test]
fn parses_function_category() {
    let src = "
pong#347773c5 msg_id:long ping_id:long = Pong;
---functions---
ping#7abe77ec ping_id:long = Pong;
";
    let defs: Vec<_> = parse_tl_file(src).collect::<Result<_, _>>().unwrap();
    assert_eq!(defs.len(), 2);
    assert_eq!(defs[0].category, Category::Types);
    assert_eq!(defs[1].category, Category::Functions);
    assert_eq!(defs[1].name, "ping");
}

#[test]
fn parses_namespaced_name() {
    let defs: Vec<_> = parse_tl_file("---functions---\nhelp.getConfig#c4f9186b = Config;")
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(defs[0].namespace, vec!["help"]);
    assert_eq!(defs[0].full_name(), "help.getConfig");
}

#[test]
fn parses_flagged_parameter() {
    let src = "user flags:# self:flags.10?true id:long = User;";
    let defs: Vec<_> = parse_tl_file(src).collect::<Result<_, _>>().unwrap();
    assert_eq!(defs[0].params.len(), 3);
    assert!(defs[0].params[1].is_true_flag());
    assert_eq!(defs[0].id(), 0x8dc08f1c);
}

#[test]
fn skips_blank_lines_and_comments() {
    let src = "
// a comment
boolTrue#997275b5 = Bool; // trailing comment

boolFalse#bc799737 = Bool;
";
    let defs: Vec<_> = parse_tl_file(src).collect::<Result<_, _>>().unwrap();
    assert_eq!(defs.len(), 2);
}

#[test]
fn multi_line_definition() {
    let src = "
resPQ#05162463 nonce:int128 server_nonce:int128
    pq:bytes server_public_key_fingerprints:Vector<long> = ResPQ;
";
    let defs: Vec<_> = parse_tl_file(src).collect::<Result<_, _>>().unwrap();
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0].params.len(), 4);
}

#[test]
fn crc32_derived_ids() {
    let src = "
boolFalse = Bool;
msg_container messages:vector<%Message> = MessageContainer;
future_salts req_msg_id:long now:int salts:vector<future_salt> = FutureSalts;
";
    let ids: Vec<u32> = parse_tl_file(src).map(|d| d.unwrap().id()).collect();
    assert_eq!(ids, vec![0xbc799737, 0x73f1f8dc, 0xae500895]);
}

#[test]
fn reports_bad_id() {
    let mut it = parse_tl_file("x#zz = X;");
    assert!(matches!(it.next(), Some(Err(ParseError::InvalidId(_)))));
}

#[test]
fn reports_missing_type() {
    let mut it = parse_tl_file("x a:int;");
    assert_eq!(it.next(), Some(Err(ParseError::MissingType)));
}
