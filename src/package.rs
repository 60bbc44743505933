//! Packages: the constant pools functions execute against.
//!
//! A package holds three tables the instruction stream indexes into: string
//! constants (as heap handles), classes, and functions. The file loader that
//! would materialize packages from disk is an external collaborator; the
//! [`PackageBuilder`] here is the in-memory definition API used by embedders
//! and tests.
//!
//! Ids follow the wire convention: non-negative ids index the package
//! tables, negative ids name builtins (see [`crate::builtins`]).

use crate::{
    builtins::{is_builtin_id, BuiltinClass, BuiltinFunction},
    class::{Class, ClassRef, ValueKind},
    function::{FuncRef, Function, FunctionDef},
    heap::Ref,
    Error, Interpreter,
};
use std::{cell::RefCell, rc::Rc};

/// Reference to an instantiated package.
pub type PackageRef = Rc<Package>;

/// An instantiated package: the constant pools of a compilation unit.
pub struct Package {
    strings: RefCell<Vec<Ref>>,
    classes: RefCell<Vec<ClassRef>>,
    functions: RefCell<Vec<FuncRef>>,
}

impl Package {
    /// Looks up a string constant by index.
    pub fn string(&self, index: i64) -> Ref {
        self.strings.borrow()[index as usize]
    }

    /// Looks up a class by index.
    pub fn class(&self, index: i64) -> ClassRef {
        self.classes.borrow()[index as usize].clone()
    }

    /// Looks up a function by index.
    pub fn function(&self, index: i64) -> FuncRef {
        self.functions.borrow()[index as usize].clone()
    }

    /// Number of functions in the package.
    pub fn function_count(&self) -> usize {
        self.functions.borrow().len()
    }

    pub(crate) fn each_constant(&self, mut f: impl FnMut(Ref)) {
        for string in self.strings.borrow().iter() {
            f(*string);
        }
        for class in self.classes.borrow().iter() {
            f(class.mirror());
        }
    }
}

/// Definition of one class in a [`PackageBuilder`].
pub struct ClassDef {
    name: String,
    supertype: i64,
    fields: Vec<ValueKind>,
    element: Option<ValueKind>,
    methods: Vec<i64>,
}

impl ClassDef {
    /// Starts a class extending the builtin root class.
    pub fn new(name: &str) -> ClassDef {
        ClassDef {
            name: name.to_owned(),
            supertype: BuiltinClass::Root.id(),
            fields: Vec::new(),
            element: None,
            methods: Vec::new(),
        }
    }

    /// Sets the supertype: a builtin class id or the index of an earlier
    /// class in the same package.
    pub fn extends(mut self, class_id: i64) -> ClassDef {
        self.supertype = class_id;
        self
    }

    /// Appends a field.
    pub fn field(mut self, kind: ValueKind) -> ClassDef {
        self.fields.push(kind);
        self
    }

    /// Declares an array part with elements of `kind`.
    pub fn element(mut self, kind: ValueKind) -> ClassDef {
        self.element = Some(kind);
        self
    }

    /// Appends a method to the virtual table: a builtin function id or the
    /// index of a function in the same package.
    pub fn method(mut self, function_id: i64) -> ClassDef {
        self.methods.push(function_id);
        self
    }
}

/// Collects definitions and instantiates them as a [`Package`].
#[derive(Default)]
pub struct PackageBuilder {
    strings: Vec<String>,
    classes: Vec<ClassDef>,
    functions: Vec<FunctionDef>,
}

impl PackageBuilder {
    /// Creates an empty builder.
    pub fn new() -> PackageBuilder {
        PackageBuilder::default()
    }

    /// Adds a string constant and returns its index.
    pub fn add_string(&mut self, text: &str) -> i64 {
        self.strings.push(text.to_owned());
        (self.strings.len() - 1) as i64
    }

    /// Adds a class definition and returns its index.
    pub fn add_class(&mut self, def: ClassDef) -> i64 {
        self.classes.push(def);
        (self.classes.len() - 1) as i64
    }

    /// Adds a function definition and returns its index.
    pub fn add_function(&mut self, def: FunctionDef) -> i64 {
        self.functions.push(def);
        (self.functions.len() - 1) as i64
    }

    /// Materializes the package inside `interp`: string constants and class
    /// mirrors are allocated on its heap, builtin references are resolved
    /// through its roots table.
    pub fn instantiate(self, interp: &mut Interpreter) -> Result<PackageRef, Error> {
        let package = Rc::new(Package {
            strings: RefCell::new(Vec::new()),
            classes: RefCell::new(Vec::new()),
            functions: RefCell::new(Vec::new()),
        });

        for text in &self.strings {
            let string = interp
                .heap_mut()
                .try_allocate_string(text)
                .ok_or_else(|| Error::Definition("heap exhausted while installing strings".into()))?;
            package.strings.borrow_mut().push(string);
        }

        for (index, def) in self.classes.iter().enumerate() {
            let supertype = if is_builtin_id(def.supertype) {
                interp.roots().builtin_class(def.supertype).clone()
            } else if (def.supertype as usize) < index {
                package.classes.borrow()[def.supertype as usize].clone()
            } else {
                return Err(Error::Definition(format!(
                    "class `{}` extends class {} which is not defined yet",
                    def.name, def.supertype
                )));
            };
            let class = Rc::new(Class::new(
                &def.name,
                Some(supertype),
                &def.fields,
                def.element,
            ));
            let mirror = interp
                .heap_mut()
                .allocate_class_mirror(class.clone())
                .ok_or_else(|| Error::Definition("heap exhausted while installing classes".into()))?;
            class.set_mirror(mirror);
            package.classes.borrow_mut().push(class);
        }

        for (index, def) in self.functions.into_iter().enumerate() {
            let function = Function::from_def(index as u32, def, &package);
            package.functions.borrow_mut().push(function);
        }

        for (index, def) in self.classes.iter().enumerate() {
            let methods = def
                .methods
                .iter()
                .map(|&id| {
                    if is_builtin_id(id) {
                        BuiltinFunction::from_id(id)
                            .map(|builtin| interp.roots().builtin_function(builtin))
                            .ok_or_else(|| {
                                Error::Definition(format!("unknown builtin function id {id}"))
                            })
                    } else if (id as usize) < package.functions.borrow().len() {
                        Ok(package.function(id))
                    } else {
                        Err(Error::Definition(format!(
                            "class `{}` lists method {id} which is not defined",
                            def.name
                        )))
                    }
                })
                .collect::<Result<Vec<_>, Error>>()?;
            package.classes.borrow()[index].set_methods(methods);
        }

        log::debug!(
            "instantiated package: {} strings, {} classes, {} functions",
            package.strings.borrow().len(),
            package.classes.borrow().len(),
            package.functions.borrow().len()
        );
        Ok(package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionBuilder;

    #[test]
    fn forward_supertype_references_are_rejected() {
        let mut builder = PackageBuilder::new();
        builder.add_class(ClassDef::new("A").extends(1));
        builder.add_class(ClassDef::new("B"));
        let mut interp = Interpreter::new();
        assert!(matches!(
            builder.instantiate(&mut interp),
            Err(Error::Definition(_)),
        ));
    }

    #[test]
    fn constants_resolve_by_index() {
        let mut builder = PackageBuilder::new();
        let greeting = builder.add_string("hi");
        let class = builder.add_class(ClassDef::new("C").field(ValueKind::I32));
        let function = builder.add_function(FunctionBuilder::new().finish());
        let mut interp = Interpreter::new();
        let package = builder.instantiate(&mut interp).unwrap();
        assert_eq!(interp.heap().string(package.string(greeting)), Some("hi"));
        assert_eq!(package.class(class).name(), "C");
        assert_eq!(package.function(function).index(), 0);
    }
}
