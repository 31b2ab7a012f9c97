use crate::objects::object_manager::ClassId;
use crate::table::Table;
use crate::value::Value;

/// A class instance. Lists are instances carrying an ordered item sequence
/// next to their (usually empty) named fields.
#[derive(Debug, Clone)]
pub struct ObjectInstance {
    pub class: ClassId,
    pub fields: Table,
    pub items: Option<Vec<Value>>,
}

impl ObjectInstance {
    pub fn new(class: ClassId) -> Self {
        ObjectInstance { class, fields: Table::new(), items: None }
    }

    pub fn new_list(class: ClassId, items: Vec<Value>) -> Self {
        ObjectInstance { class, fields: Table::new(), items: Some(items) }
    }

    pub fn is_list(&self) -> bool {
        self.items.is_some()
    }
}
