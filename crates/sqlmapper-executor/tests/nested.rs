//! Nested result shapes: join collapsing, row identity, discriminators,
//! automapping, and constructor paths.

mod support;

use serde_json::json;
use sqlmapper_core::{
    Configuration, ConstructorMapping, ConstructorSig, Discriminator, ParamBag,
    ParameterMapping, PropertyDescriptor, PropertyMapping, ResultShape, RowBounds, SourceType,
    StatementDescriptor, StatementKind, StaticSqlSource, TargetType, TypeDescriptor, Value,
};
use sqlmapper_executor::{RowValue, Session};
use std::sync::Arc;
use support::{MockBackend, col};

fn object_handle(value: &RowValue) -> sqlmapper_core::ObjectHandle {
    match value {
        RowValue::Object(h) => *h,
        RowValue::Value(v) => panic!("expected object, got value {v}"),
    }
}

fn blog_config() -> Configuration {
    let mut config = Configuration::new("test");
    config.types.register(
        TypeDescriptor::new("Author")
            .property(PropertyDescriptor::new("id", TargetType::Int64))
            .property(PropertyDescriptor::new("name", TargetType::Text))
            .property(PropertyDescriptor::new("posts", TargetType::Raw).collection(true)),
    );
    config.types.register(
        TypeDescriptor::new("Post")
            .property(PropertyDescriptor::new("id", TargetType::Int64))
            .property(PropertyDescriptor::new("subject", TargetType::Text)),
    );
    config.add_shape(
        ResultShape::new("post", "Post")
            .mapping(PropertyMapping::id("id", "id").target_type(TargetType::Int64))
            .mapping(PropertyMapping::column("subject", "subject").target_type(TargetType::Text)),
    );
    config.add_shape(
        ResultShape::new("author", "Author")
            .mapping(PropertyMapping::id("id", "id").target_type(TargetType::Int64))
            .mapping(PropertyMapping::column("name", "name").target_type(TargetType::Text))
            .mapping(
                PropertyMapping::nested("posts", "post")
                    .column_prefix("post_")
                    .collection(true),
            ),
    );
    config.add_statement(
        StatementDescriptor::new(
            "authorsWithPosts",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new(
                "SELECT a.id, a.name, p.id AS post_id, p.subject AS post_subject \
                 FROM authors a LEFT JOIN posts p ON p.author_id = a.id",
            )),
        )
        .shape("author"),
    );
    config
}

fn blog_columns() -> Vec<sqlmapper_core::ColumnMeta> {
    vec![
        col("id", SourceType::BigInt),
        col("name", SourceType::Varchar),
        col("post_id", SourceType::BigInt),
        col("post_subject", SourceType::Varchar),
    ]
}

fn blog_rows() -> Vec<Vec<Value>> {
    vec![
        vec![Value::BigInt(1), Value::Text("ann".into()), Value::BigInt(10), Value::Text("first".into())],
        vec![Value::BigInt(1), Value::Text("ann".into()), Value::BigInt(11), Value::Text("second".into())],
        vec![Value::BigInt(1), Value::Text("ann".into()), Value::BigInt(12), Value::Text("third".into())],
        vec![Value::BigInt(2), Value::Text("bob".into()), Value::Null, Value::Null],
    ]
}

#[test]
fn join_rows_collapse_into_one_parent_per_key() {
    let backend = MockBackend::new().with_rows("authorsWithPosts", blog_columns(), blog_rows());
    let mut session = Session::new(Arc::new(blog_config()), backend);

    let list = session.query("authorsWithPosts", &ParamBag::new()).unwrap();
    assert_eq!(list.present().count(), 2);

    let ann = session.arena().object_json(object_handle(list.get(0).unwrap()));
    assert_eq!(ann["name"], json!("ann"));
    assert_eq!(
        ann["posts"],
        json!([
            {"id": 10, "subject": "first"},
            {"id": 11, "subject": "second"},
            {"id": 12, "subject": "third"},
        ])
    );

    // A parent with no child rows still gets its collection instantiated.
    let bob = session.arena().object_json(object_handle(list.get(1).unwrap()));
    assert_eq!(bob["posts"], json!([]));
}

#[test]
fn interleaved_rows_merge_regardless_of_order() {
    let rows = vec![
        vec![Value::BigInt(1), Value::Text("ann".into()), Value::BigInt(10), Value::Text("first".into())],
        vec![Value::BigInt(2), Value::Text("bob".into()), Value::BigInt(20), Value::Text("hello".into())],
        vec![Value::BigInt(1), Value::Text("ann".into()), Value::BigInt(11), Value::Text("second".into())],
    ];
    let backend = MockBackend::new().with_rows("authorsWithPosts", blog_columns(), rows);
    let mut session = Session::new(Arc::new(blog_config()), backend);

    let list = session.query("authorsWithPosts", &ParamBag::new()).unwrap();
    assert_eq!(list.present().count(), 2);

    let ann = session.arena().object_json(object_handle(list.get(0).unwrap()));
    assert_eq!(ann["posts"].as_array().unwrap().len(), 2);
    let bob = session.arena().object_json(object_handle(list.get(1).unwrap()));
    assert_eq!(bob["posts"].as_array().unwrap().len(), 1);
}

#[test]
fn result_ordered_emits_each_group_once() {
    let mut config = blog_config();
    config.add_statement(
        StatementDescriptor::new(
            "authorsOrdered",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new(
                "SELECT ... ORDER BY a.id",
            )),
        )
        .shape("author")
        .result_ordered(true),
    );
    let backend = MockBackend::new().with_rows("authorsOrdered", blog_columns(), blog_rows());
    let mut session = Session::new(Arc::new(config), backend);

    let list = session.query("authorsOrdered", &ParamBag::new()).unwrap();
    assert_eq!(list.present().count(), 2);
    let ann = session.arena().object_json(object_handle(list.get(0).unwrap()));
    assert_eq!(ann["posts"].as_array().unwrap().len(), 3);
}

#[test]
fn streaming_cursor_over_ordered_groups() {
    let mut config = blog_config();
    config.add_statement(
        StatementDescriptor::new(
            "authorsOrdered",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new("SELECT ... ORDER BY a.id")),
        )
        .shape("author")
        .result_ordered(true),
    );
    let backend = MockBackend::new().with_rows("authorsOrdered", blog_columns(), blog_rows());
    let mut session = Session::new(Arc::new(config), backend);

    let mut cursor = session
        .query_cursor("authorsOrdered", &ParamBag::new(), RowBounds::DEFAULT)
        .unwrap();
    let first = cursor.next().unwrap().unwrap();
    let second = cursor.next().unwrap().unwrap();
    assert!(cursor.next().unwrap().is_none());

    let ann = object_handle(&first);
    let bob = object_handle(&second);
    // Materialization happened while streaming; the arena holds both trees.
    drop(cursor);
    assert_eq!(session.arena().object_json(ann)["name"], json!("ann"));
    assert_eq!(session.arena().object_json(bob)["name"], json!("bob"));
}

#[test]
fn streaming_unordered_nested_shapes_is_guarded() {
    let backend = MockBackend::new().with_rows("authorsWithPosts", blog_columns(), blog_rows());
    let mut session = Session::new(Arc::new(blog_config()), backend);
    let error = session
        .query_cursor("authorsWithPosts", &ParamBag::new(), RowBounds::DEFAULT)
        .unwrap_err();
    assert!(error.is_configuration());

    let mut config = blog_config();
    config.settings.safe_cursor = false;
    let backend = MockBackend::new().with_rows("authorsWithPosts", blog_columns(), blog_rows());
    let mut session = Session::new(Arc::new(config), backend);
    let mut cursor = session
        .query_cursor("authorsWithPosts", &ParamBag::new(), RowBounds::DEFAULT)
        .unwrap();
    let mut emitted = 0;
    while cursor.next().unwrap().is_some() {
        emitted += 1;
    }
    assert_eq!(emitted, 2);
}

#[test]
fn row_bounds_on_nested_shapes_respect_safe_mode() {
    let mut config = blog_config();
    config.settings.safe_row_bounds = true;
    let backend = MockBackend::new().with_rows("authorsWithPosts", blog_columns(), blog_rows());
    let mut session = Session::new(Arc::new(config), backend);
    let error = session
        .query_bounded("authorsWithPosts", &ParamBag::new(), RowBounds::new(0, 1))
        .unwrap_err();
    assert!(error.is_configuration());
}

#[test]
fn self_referencing_shape_links_back_to_the_ancestor() {
    let mut config = Configuration::new("test");
    config.types.register(
        TypeDescriptor::new("Node")
            .property(PropertyDescriptor::new("id", TargetType::Int64))
            .property(PropertyDescriptor::new("parent", TargetType::Raw)),
    );
    config.add_shape(
        ResultShape::new("node", "Node")
            .mapping(PropertyMapping::id("id", "id").target_type(TargetType::Int64))
            .mapping(PropertyMapping::nested("parent", "node")),
    );
    config.add_statement(
        StatementDescriptor::new(
            "selfNode",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new("SELECT id FROM nodes")),
        )
        .shape("node"),
    );
    let columns = vec![col("id", SourceType::BigInt)];
    let backend = MockBackend::new().with_rows("selfNode", columns, vec![vec![Value::BigInt(1)]]);
    let mut session = Session::new(Arc::new(config), backend);

    let list = session.query("selfNode", &ParamBag::new()).unwrap();
    let node = session.arena().object_json(object_handle(list.get(0).unwrap()));
    assert_eq!(node["parent"]["$cycle"], json!("Node"));
}

#[test]
fn not_null_columns_gate_child_materialization() {
    let mut config = blog_config();
    config.add_shape(
        ResultShape::new("author_guarded", "Author")
            .mapping(PropertyMapping::id("id", "id").target_type(TargetType::Int64))
            .mapping(PropertyMapping::column("name", "name").target_type(TargetType::Text))
            .mapping(
                PropertyMapping::nested("posts", "post")
                    .column_prefix("post_")
                    .collection(true)
                    .not_null_columns(vec!["id".to_string()]),
            ),
    );
    config.add_statement(
        StatementDescriptor::new(
            "guardedAuthors",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new("SELECT ...")),
        )
        .shape("author_guarded"),
    );
    // The subject survives the join but the id is gone; the guard column
    // says no child exists on this row.
    let rows = vec![vec![
        Value::BigInt(1),
        Value::Text("ann".into()),
        Value::Null,
        Value::Text("orphan".into()),
    ]];
    let backend = MockBackend::new().with_rows("guardedAuthors", blog_columns(), rows);
    let mut session = Session::new(Arc::new(config), backend);

    let list = session.query("guardedAuthors", &ParamBag::new()).unwrap();
    let ann = session.arena().object_json(object_handle(list.get(0).unwrap()));
    assert_eq!(ann["posts"], json!([]));
}

#[test]
fn discriminator_routes_rows_to_case_shapes() {
    let mut config = Configuration::new("test");
    config.types.register(
        TypeDescriptor::new("Vehicle")
            .property(PropertyDescriptor::new("id", TargetType::Int64))
            .property(PropertyDescriptor::new("kind", TargetType::Int32)),
    );
    config.types.register(
        TypeDescriptor::new("Car")
            .property(PropertyDescriptor::new("id", TargetType::Int64))
            .property(PropertyDescriptor::new("doors", TargetType::Int32)),
    );
    config.add_shape(
        ResultShape::new("car", "Car")
            .mapping(PropertyMapping::id("id", "id").target_type(TargetType::Int64))
            .mapping(PropertyMapping::column("doors", "doors").target_type(TargetType::Int32)),
    );
    config.add_shape(
        ResultShape::new("vehicle", "Vehicle")
            .mapping(PropertyMapping::id("id", "id").target_type(TargetType::Int64))
            .mapping(PropertyMapping::column("kind", "vtype").target_type(TargetType::Int32))
            .discriminator(Discriminator::new("vtype", TargetType::Int32).case("1", "car")),
    );
    config.add_statement(
        StatementDescriptor::new(
            "vehicles",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new("SELECT id, vtype, doors FROM vehicles")),
        )
        .shape("vehicle"),
    );
    let columns = vec![
        col("id", SourceType::BigInt),
        col("vtype", SourceType::Integer),
        col("doors", SourceType::Integer),
    ];
    let rows = vec![
        vec![Value::BigInt(1), Value::Int(1), Value::Int(4)],
        // No case for this value: the base shape applies.
        vec![Value::BigInt(2), Value::Int(9), Value::Int(2)],
    ];
    let backend = MockBackend::new().with_rows("vehicles", columns, rows);
    let mut session = Session::new(Arc::new(config), backend);

    let list = session.query("vehicles", &ParamBag::new()).unwrap();
    let car = object_handle(list.get(0).unwrap());
    let other = object_handle(list.get(1).unwrap());
    assert_eq!(session.arena().get(car).unwrap().type_name, "Car");
    assert_eq!(session.arena().object_json(car)["doors"], json!(4));
    assert_eq!(session.arena().get(other).unwrap().type_name, "Vehicle");
    assert_eq!(session.arena().object_json(other)["kind"], json!(9));
}

#[test]
fn discriminator_case_naming_unknown_shape_fails() {
    let mut config = Configuration::new("test");
    config.types.register(
        TypeDescriptor::new("Vehicle").property(PropertyDescriptor::new("id", TargetType::Int64)),
    );
    config.add_shape(
        ResultShape::new("vehicle", "Vehicle")
            .mapping(PropertyMapping::id("id", "id").target_type(TargetType::Int64))
            .discriminator(Discriminator::new("vtype", TargetType::Int32).case("1", "missing")),
    );
    config.add_statement(
        StatementDescriptor::new(
            "vehicles",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new("SELECT id, vtype FROM vehicles")),
        )
        .shape("vehicle"),
    );
    let columns = vec![col("id", SourceType::BigInt), col("vtype", SourceType::Integer)];
    let rows = vec![vec![Value::BigInt(1), Value::Int(1)]];
    let backend = MockBackend::new().with_rows("vehicles", columns, rows);
    let mut session = Session::new(Arc::new(config), backend);

    let error = session.query("vehicles", &ParamBag::new()).unwrap_err();
    assert!(error.is_configuration());
}

#[test]
fn discriminator_pointing_at_itself_terminates() {
    let mut config = Configuration::new("test");
    config.types.register(
        TypeDescriptor::new("Vehicle").property(PropertyDescriptor::new("id", TargetType::Int64)),
    );
    config.add_shape(
        ResultShape::new("vehicle", "Vehicle")
            .mapping(PropertyMapping::id("id", "id").target_type(TargetType::Int64))
            .discriminator(Discriminator::new("vtype", TargetType::Int32).case("1", "vehicle")),
    );
    config.add_statement(
        StatementDescriptor::new(
            "vehicles",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new("SELECT id, vtype FROM vehicles")),
        )
        .shape("vehicle"),
    );
    let columns = vec![col("id", SourceType::BigInt), col("vtype", SourceType::Integer)];
    let rows = vec![vec![Value::BigInt(1), Value::Int(1)]];
    let backend = MockBackend::new().with_rows("vehicles", columns, rows);
    let mut session = Session::new(Arc::new(config), backend);

    let list = session.query("vehicles", &ParamBag::new()).unwrap();
    assert_eq!(list.present().count(), 1);
}

#[test]
fn automapping_translates_underscored_columns() {
    let mut config = Configuration::new("test");
    config.settings.map_underscore_to_camel_case = true;
    config.types.register(
        TypeDescriptor::new("User")
            .property(PropertyDescriptor::new("userName", TargetType::Text)),
    );
    config.add_shape(ResultShape::new("user", "User"));
    config.add_statement(
        StatementDescriptor::new(
            "users",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new("SELECT user_name FROM users")),
        )
        .shape("user"),
    );
    let columns = vec![col("user_name", SourceType::Varchar)];
    let rows = vec![vec![Value::Text("ann".into())]];
    let backend = MockBackend::new().with_rows("users", columns, rows);
    let mut session = Session::new(Arc::new(config), backend);

    let list = session.query("users", &ParamBag::new()).unwrap();
    let user = session.arena().object_json(object_handle(list.get(0).unwrap()));
    assert_eq!(user["userName"], json!("ann"));
}

#[test]
fn automapping_without_translation_skips_underscored_columns() {
    let mut config = Configuration::new("test");
    config.types.register(
        TypeDescriptor::new("User")
            .property(PropertyDescriptor::new("userName", TargetType::Text)),
    );
    config.add_shape(ResultShape::new("user", "User"));
    config.add_statement(
        StatementDescriptor::new(
            "users",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new("SELECT user_name FROM users")),
        )
        .shape("user"),
    );
    let columns = vec![col("user_name", SourceType::Varchar)];
    let rows = vec![vec![Value::Text("ann".into())]];
    let backend = MockBackend::new().with_rows("users", columns, rows);
    let mut session = Session::new(Arc::new(config), backend);

    let list = session.query("users", &ParamBag::new()).unwrap();
    // The column matched nothing, so the row produced no object.
    assert_eq!(list.present().count(), 0);
}

#[test]
fn constructor_mappings_build_immutable_objects() {
    let mut config = Configuration::new("test");
    config.types.register(
        TypeDescriptor::new("Point")
            .default_constructor(false)
            .property(PropertyDescriptor::new("x", TargetType::Int32))
            .property(PropertyDescriptor::new("y", TargetType::Int32)),
    );
    config.add_shape(
        ResultShape::new("point", "Point")
            .constructor_arg(ConstructorMapping::new("x", TargetType::Int32).named("x"))
            .constructor_arg(ConstructorMapping::new("y", TargetType::Int32).named("y")),
    );
    config.add_statement(
        StatementDescriptor::new(
            "points",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new("SELECT x, y FROM points")),
        )
        .shape("point"),
    );
    let columns = vec![col("x", SourceType::Integer), col("y", SourceType::Integer)];
    let rows = vec![
        vec![Value::Int(3), Value::Int(4)],
        vec![Value::Null, Value::Null],
    ];
    let backend = MockBackend::new().with_rows("points", columns, rows);
    let mut session = Session::new(Arc::new(config), backend);

    let list = session.query("points", &ParamBag::new()).unwrap();
    // The all-null row produced nothing.
    assert_eq!(list.present().count(), 1);
    let point = session.arena().object_json(object_handle(list.get(0).unwrap()));
    assert_eq!(point, json!({"x": 3, "y": 4}));
}

#[test]
fn declared_constructor_signature_matches_cursor_columns() {
    let mut config = Configuration::new("test");
    config.types.register(
        TypeDescriptor::new("Pair")
            .default_constructor(false)
            .constructor(ConstructorSig::new(vec![
                ("id".to_string(), TargetType::Int64),
                ("label".to_string(), TargetType::Text),
            ])),
    );
    config.add_shape(ResultShape::new("pair", "Pair"));
    config.add_statement(
        StatementDescriptor::new(
            "pairs",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new("SELECT id, label FROM pairs")),
        )
        .shape("pair"),
    );
    let columns = vec![col("id", SourceType::BigInt), col("label", SourceType::Varchar)];
    let rows = vec![vec![Value::BigInt(5), Value::Text("five".into())]];
    let backend = MockBackend::new().with_rows("pairs", columns, rows);
    let mut session = Session::new(Arc::new(config), backend);

    let list = session.query("pairs", &ParamBag::new()).unwrap();
    let pair = session.arena().object_json(object_handle(list.get(0).unwrap()));
    assert_eq!(pair, json!({"id": 5, "label": "five"}));
}

#[test]
fn nested_query_join_columns_do_not_split_row_identity() {
    let mut config = Configuration::new("test");
    config.types.register(
        TypeDescriptor::new("Post")
            .property(PropertyDescriptor::new("subject", TargetType::Text))
            .property(PropertyDescriptor::new("author", TargetType::Raw))
            .property(PropertyDescriptor::new("tags", TargetType::Raw).collection(true)),
    );
    config.types.register(
        TypeDescriptor::new("Tag").property(PropertyDescriptor::new("label", TargetType::Text)),
    );
    config.types.register(
        TypeDescriptor::new("Author")
            .property(PropertyDescriptor::new("id", TargetType::Int64))
            .property(PropertyDescriptor::new("name", TargetType::Text)),
    );
    config.add_shape(
        ResultShape::new("tag", "Tag")
            .mapping(PropertyMapping::column("label", "label").target_type(TargetType::Text)),
    );
    config.add_shape(
        ResultShape::new("author", "Author")
            .mapping(PropertyMapping::id("id", "id").target_type(TargetType::Int64))
            .mapping(PropertyMapping::column("name", "name").target_type(TargetType::Text)),
    );
    // No id mappings: row identity falls back to the mapped properties.
    // The join column feeding the author sub-query is a parameter, not
    // part of the row's identity, so it must not contribute.
    config.add_shape(
        ResultShape::new("post", "Post")
            .mapping(PropertyMapping::column("subject", "subject").target_type(TargetType::Text))
            .mapping(PropertyMapping::query("author", "author_id", "selectAuthor"))
            .mapping(
                PropertyMapping::nested("tags", "tag")
                    .column_prefix("tag_")
                    .collection(true),
            ),
    );
    config.add_statement(
        StatementDescriptor::new(
            "selectPosts",
            StatementKind::Query,
            Arc::new(StaticSqlSource::new(
                "SELECT subject, author_id, tag_label FROM posts",
            )),
        )
        .shape("post"),
    );
    config.add_statement(
        StatementDescriptor::new(
            "selectAuthor",
            StatementKind::Query,
            Arc::new(
                StaticSqlSource::new("SELECT id, name FROM authors WHERE id = ?")
                    .with_parameters(vec![ParameterMapping::input("value")]),
            ),
        )
        .shape("author"),
    );
    let backend = MockBackend::new()
        .with_rows(
            "selectPosts",
            vec![
                col("subject", SourceType::Varchar),
                col("author_id", SourceType::BigInt),
                col("tag_label", SourceType::Varchar),
            ],
            vec![
                vec![Value::Text("intro".into()), Value::BigInt(7), Value::Text("rust".into())],
                vec![Value::Text("intro".into()), Value::BigInt(9), Value::Text("rust".into())],
            ],
        )
        .with_rows(
            "selectAuthor",
            vec![col("id", SourceType::BigInt), col("name", SourceType::Varchar)],
            vec![vec![Value::BigInt(7), Value::Text("ann".into())]],
        );
    let probe = backend.probe();
    let mut session = Session::new(Arc::new(config), backend);

    let list = session.query("selectPosts", &ParamBag::new()).unwrap();
    // Both rows describe the same post; only the first materialized and
    // only its author was fetched.
    assert_eq!(list.present().count(), 1);
    assert_eq!(probe.query_count("selectAuthor"), 1);
    let post = session.arena().object_json(object_handle(list.get(0).unwrap()));
    assert_eq!(post["subject"], json!("intro"));
    assert_eq!(post["author"]["name"], json!("ann"));
    assert_eq!(post["tags"].as_array().unwrap().len(), 1);
}
