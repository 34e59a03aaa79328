//! Object store round trips through a real SQLite database.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use middlestore_core::{
    AttrDef, Error, FetchQuery, FieldValue, KlassDef, Model, ModelBuilder, ObjRef, ObjectStore, StoreSettings, Value,
};
use middlestore_sql::{Connection, SqlPersistence, SqlStoreConfig};
use middlestore_sqlite::SqliteDriver;

fn model() -> Arc<Model> {
    ModelBuilder::new("Zoo")
        .klass(
            KlassDef::new("Keeper")
                .attr(AttrDef::string("name").required())
                .attr(AttrDef::date("born"))
                .attr(AttrDef::time("shiftStart"))
                .attr(AttrDef::datetime("lastSeen"))
                .attr(AttrDef::bool("active"))
                .attr(AttrDef::float("height"))
                .attr(AttrDef::long("badge"))
                .attr(AttrDef::decimal("salary", 10, 2))
                .attr(AttrDef::enumeration("shift", ["day", "night"]))
                .attr(AttrDef::list("animals", "Animal", "keeper")),
        )
        .klass(
            KlassDef::new("Animal")
                .attr(AttrDef::string("species"))
                .attr(AttrDef::obj_ref("keeper", "Keeper")),
        )
        .build()
        .unwrap()
}

struct Fixture {
    model: Arc<Model>,
    driver: Arc<SqliteDriver>,
    config: SqlStoreConfig,
}

impl Fixture {
    fn new(config: SqlStoreConfig) -> Self {
        let model = model();
        let driver = SqliteDriver::in_memory().unwrap().shared();
        SqlPersistence::new(driver.clone(), config.clone())
            .unwrap()
            .install_schema(&model)
            .unwrap();
        Self { model, driver, config }
    }

    /// A new store over the same database, with an empty identity map.
    fn store(&self) -> Arc<ObjectStore> {
        let sql = SqlPersistence::new(self.driver.clone(), self.config.clone()).unwrap();
        ObjectStore::new(Arc::clone(&self.model), StoreSettings::default(), sql).unwrap()
    }

    fn raw(&self, sql: &str) {
        self.driver.connect_sqlite().unwrap().execute(sql, &[]).unwrap();
    }
}

#[test]
fn test_values_survive_a_round_trip() {
    let fx = Fixture::new(SqlStoreConfig::default());
    let born = NaiveDate::from_ymd_opt(1990, 5, 17).unwrap();
    let shift_start = NaiveTime::from_hms_opt(7, 30, 0).unwrap();
    let last_seen = born.and_hms_opt(12, 0, 1).unwrap();

    let serial = {
        let store = fx.store();
        let keeper = store.create_object("Keeper").unwrap();
        keeper.set("name", "Ada").unwrap();
        keeper.set("born", born).unwrap();
        keeper.set("shiftStart", shift_start).unwrap();
        keeper.set("lastSeen", last_seen).unwrap();
        keeper.set("active", true).unwrap();
        keeper.set("height", 1.75).unwrap();
        keeper.set("badge", 5_000_000_000_i64).unwrap();
        keeper.set("salary", Value::Decimal("1234.50".to_string())).unwrap();
        keeper.set("shift", "night").unwrap();
        store.add_object(&keeper).unwrap();
        store.save_changes().unwrap();
        keeper.serial_num()
    };

    let store = fx.store();
    let keeper = store.fetch_object("Keeper", serial).unwrap();
    assert_eq!(keeper.get_string("name").unwrap().as_deref(), Some("Ada"));
    assert_eq!(keeper.value("born").unwrap(), Value::Date(born));
    assert_eq!(keeper.value("shiftStart").unwrap(), Value::Time(shift_start));
    assert_eq!(keeper.value("lastSeen").unwrap(), Value::Timestamp(last_seen));
    assert_eq!(keeper.get_bool("active").unwrap(), Some(true));
    assert_eq!(keeper.get_f64("height").unwrap(), Some(1.75));
    assert_eq!(keeper.get_i64("badge").unwrap(), Some(5_000_000_000));
    assert_eq!(keeper.get_f64("salary").unwrap(), Some(1234.5));
    assert_eq!(keeper.get_string("shift").unwrap().as_deref(), Some("night"));
    assert!(keeper.is_committed());
    assert!(!keeper.is_dirty());
}

#[test]
fn test_fetch_returns_the_live_instance() {
    let fx = Fixture::new(SqlStoreConfig::default());
    let store = fx.store();
    let keeper = store.create_object("Keeper").unwrap();
    keeper.set("name", "Ben").unwrap();
    store.add_object(&keeper).unwrap();
    store.save_changes().unwrap();

    let fetched = store.fetch_object("Keeper", keeper.serial_num()).unwrap();
    assert!(Arc::ptr_eq(&fetched, &keeper));
    let all = store.fetch_objects_of_class("Keeper", &FetchQuery::new()).unwrap();
    assert_eq!(all.len(), 1);
    assert!(Arc::ptr_eq(&all[0], &keeper));

    let missing = store.fetch_object("Keeper", 999).unwrap_err();
    assert!(matches!(missing, Error::UnknownObject(_)));
}

#[test]
fn test_refresh_respects_unsaved_changes() {
    let fx = Fixture::new(SqlStoreConfig::default());
    let store = fx.store();
    let keeper = store.create_object("Keeper").unwrap();
    keeper.set("name", "Cy").unwrap();
    store.add_object(&keeper).unwrap();
    store.save_changes().unwrap();

    let serial = keeper.serial_num();
    fx.raw(&format!("UPDATE \"Keeper\" SET \"name\" = 'Cyrus' WHERE \"serialNum\" = {serial}"));
    store.refresh_object(&keeper).unwrap();
    assert_eq!(keeper.get_string("name").unwrap().as_deref(), Some("Cyrus"));

    keeper.set("name", "Local").unwrap();
    fx.raw(&format!("UPDATE \"Keeper\" SET \"name\" = 'Remote' WHERE \"serialNum\" = {serial}"));
    store.refresh_object(&keeper).unwrap();
    assert_eq!(keeper.get_string("name").unwrap().as_deref(), Some("Local"));
}

#[test]
fn test_stored_references_resolve_on_access() {
    let fx = Fixture::new(SqlStoreConfig::default());
    let (keeper_serial, animal_serial) = {
        let store = fx.store();
        let keeper = store.create_object("Keeper").unwrap();
        keeper.set("name", "Dee").unwrap();
        let animal = store.create_object("Animal").unwrap();
        animal.set("species", "otter").unwrap();
        store.add_object(&keeper).unwrap();
        keeper.add_to_list("animals", &animal).unwrap();
        store.save_changes().unwrap();
        (keeper.serial_num(), animal.serial_num())
    };

    let store = fx.store();
    let animal = store.fetch_object("Animal", animal_serial).unwrap();
    let keeper = animal.get_object("keeper").unwrap().unwrap();
    assert_eq!(keeper.serial_num(), keeper_serial);
    assert!(Arc::ptr_eq(&keeper, &store.fetch_object("Keeper", keeper_serial).unwrap()));

    let animals = keeper.list("animals").unwrap();
    assert_eq!(animals.len(), 1);
    assert!(Arc::ptr_eq(&animals[0], &animal));
}

#[test]
fn test_dangling_and_zero_serial_references() {
    let fx = Fixture::new(SqlStoreConfig::default());
    fx.raw("INSERT INTO \"Animal\" (\"species\", \"keeperClassId\", \"keeperObjId\") VALUES ('yak', 1, 42)");
    fx.raw("INSERT INTO \"Animal\" (\"species\", \"keeperClassId\", \"keeperObjId\") VALUES ('gnu', 1, 0)");

    let store = fx.store();
    let yak = store.fetch_object("Animal", 1).unwrap();
    let err = yak.get_object("keeper").unwrap_err();
    assert!(matches!(err, Error::ObjRefDangles(ref e) if e.serial_num == 42));
    assert!(err.is_recoverable());

    let gnu = store.fetch_object("Animal", 2).unwrap();
    let err = gnu.get_object("keeper").unwrap_err();
    assert!(matches!(err, Error::ObjRefZeroSerialNum(_)));

    let err = store.fetch_obj_ref(ObjRef::join(1, 42)).unwrap_err();
    assert!(matches!(err, Error::ObjRefDangles(_)));
}

#[test]
fn test_zero_and_null_reference_columns_read_as_no_reference() {
    let fx = Fixture::new(SqlStoreConfig::default());
    fx.raw("INSERT INTO \"Animal\" (\"species\", \"keeperClassId\", \"keeperObjId\") VALUES ('emu', 0, 0)");
    fx.raw("INSERT INTO \"Animal\" (\"species\", \"keeperClassId\", \"keeperObjId\") VALUES ('elk', NULL, NULL)");
    fx.raw("INSERT INTO \"Animal\" (\"species\", \"keeperClassId\", \"keeperObjId\") VALUES ('ibis', 1, NULL)");

    let store = fx.store();
    for serial in 1..=3 {
        let animal = store.fetch_object("Animal", serial).unwrap();
        let keeper = animal.klass().attr("keeper").unwrap();
        assert!(matches!(animal.raw_value(keeper), FieldValue::Null));
        assert!(animal.get_object("keeper").unwrap().is_none());
    }
    assert!(store.fetch_obj_ref(ObjRef::NULL).unwrap().is_none());
}

#[test]
fn test_packed_reference_columns() {
    let fx = Fixture::new(SqlStoreConfig::default().use_bigint_obj_ref_columns(true));
    let animal_serial = {
        let store = fx.store();
        let keeper = store.create_object("Keeper").unwrap();
        keeper.set("name", "Eve").unwrap();
        let animal = store.create_object("Animal").unwrap();
        animal.set("keeper", &keeper).unwrap();
        store.add_object(&animal).unwrap();
        store.save_changes().unwrap();
        animal.serial_num()
    };

    let rows = fx
        .driver
        .connect_sqlite()
        .unwrap()
        .query("SELECT \"keeperId\" FROM \"Animal\"", &[])
        .unwrap();
    let packed = ObjRef::from_i64(rows[0].get(0).as_i64().unwrap());
    assert_eq!(packed.klass_id(), 1);

    let store = fx.store();
    let animal = store.fetch_object("Animal", animal_serial).unwrap();
    let keeper = animal.get_object("keeper").unwrap().unwrap();
    assert_eq!(keeper.get_string("name").unwrap().as_deref(), Some("Eve"));
}

#[test]
fn test_klass_ids_are_verified_and_dumped() {
    let fx = Fixture::new(SqlStoreConfig::default());
    let sql = SqlPersistence::new(fx.driver.clone(), SqlStoreConfig::default()).unwrap();
    let _store = ObjectStore::new(Arc::clone(&fx.model), StoreSettings::default(), sql.clone()).unwrap();
    let mut out = Vec::new();
    sql.dump_klass_ids(&mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "id,name\n1,Keeper\n2,Animal\n");

    fx.raw("UPDATE \"_MKClassIds\" SET \"id\" = 9 WHERE \"name\" = 'Animal'");
    let sql = SqlPersistence::new(fx.driver.clone(), SqlStoreConfig::default()).unwrap();
    let err = ObjectStore::new(Arc::clone(&fx.model), StoreSettings::default(), sql).unwrap_err();
    assert!(matches!(err, Error::Model(_)));
}

#[test]
fn test_file_database_outlives_its_driver() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zoo.db");
    let model = model();

    let driver = SqliteDriver::open(&path).shared();
    assert!(!driver.is_in_memory());
    assert_eq!(driver.path(), Some(path.as_path()));
    let sql = SqlPersistence::new(driver.clone(), SqlStoreConfig::default()).unwrap();
    sql.install_schema(&model).unwrap();
    let store = ObjectStore::new(Arc::clone(&model), StoreSettings::default(), sql).unwrap();
    let keeper = store.create_object("Keeper").unwrap();
    keeper.set("name", "Fay").unwrap();
    store.add_object(&keeper).unwrap();
    store.save_changes().unwrap();
    drop(store);
    drop(driver);

    let sql = SqlPersistence::new(SqliteDriver::open(&path).shared(), SqlStoreConfig::default()).unwrap();
    let store = ObjectStore::new(model, StoreSettings::default(), sql).unwrap();
    let keepers = store.fetch_objects_of_class("Keeper", &FetchQuery::new()).unwrap();
    assert_eq!(keepers.len(), 1);
    assert_eq!(keepers[0].get_string("name").unwrap().as_deref(), Some("Fay"));
}
